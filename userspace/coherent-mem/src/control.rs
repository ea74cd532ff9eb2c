// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Administrative control surface for range migration
//! OWNERS: @kernel-mm-team
//! STATUS: Functional (host-first)
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit + property tests below + `tests/control_surface.rs`
//!
//! Three entry points:
//!   - `ioctl(space, cmd, addr)`: numeric command, migrates the mapping containing `addr`
//!   - `write(bytes)`: `pid,start,end,node` text command
//!   - `usage()`: fixed help line
//!
//! Text commands are parsed leniently by default: missing or malformed fields become
//! 0 and the command still runs. `ParseMode::Strict` rejects them instead.

use log::{info, warn};

use crate::address_space::AddressSpace;
use crate::error::{Error, Result};
use crate::migrate::{MigrationController, MigrationRequest};
use crate::tier::{NodeId, Tier};

/// Text returned by a usage read.
pub const USAGE: &str = "Expected Value: <pid,vaddr,size,nid>\n";

/// Size of the command buffer, terminator included.
pub const COMMAND_BUF_LEN: usize = 100;

const MAX_FIELDS: usize = 4;

/// Numeric control commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ControlCommand {
    /// Move a range onto the coherent tier.
    MoveToCoherent = 1,
    /// Move a range back onto the default tier.
    MoveToDefault = 2,
}

impl ControlCommand {
    /// Decodes a command code.
    pub fn from_code(code: u32) -> Result<Self> {
        match code {
            1 => Ok(Self::MoveToCoherent),
            2 => Ok(Self::MoveToDefault),
            other => Err(Error::InvalidCommand(format!("unknown command code {other}"))),
        }
    }

    pub fn code(self) -> u32 {
        self as u32
    }

    /// Destination tier of the command.
    pub fn tier(self) -> Tier {
        match self {
            Self::MoveToCoherent => Tier::Coherent,
            Self::MoveToDefault => Tier::Default,
        }
    }
}

/// How text commands treat bad input.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ParseMode {
    /// Missing or malformed fields become 0; fields past the fourth are ignored.
    #[default]
    Lenient,
    /// Exactly four well-formed fields with `start < end`.
    Strict,
}

/// Parses an unsigned integer the way kernel `kstrtou64(.., 0, ..)` does.
///
/// `0x`/`0X` selects hexadecimal, a leading `0` octal, anything else decimal. A single
/// trailing newline is accepted.
pub fn parse_u64(field: &str) -> Option<u64> {
    let field = field.strip_suffix('\n').unwrap_or(field);
    let field = field.strip_prefix('+').unwrap_or(field);
    let (digits, radix) = if let Some(hex) =
        field.strip_prefix("0x").or_else(|| field.strip_prefix("0X"))
    {
        (hex, 16)
    } else if field.len() > 1 && field.starts_with('0') {
        (&field[1..], 8)
    } else {
        (field, 10)
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
        return None;
    }
    u64::from_str_radix(digits, radix).ok()
}

/// Parses `pid,start,end,node` from `bytes`.
///
/// Input beyond the command buffer is ignored.
pub fn parse_command(bytes: &[u8], mode: ParseMode) -> Result<MigrationRequest> {
    let bytes = &bytes[..bytes.len().min(COMMAND_BUF_LEN - 1)];
    let fields: Vec<&[u8]> = bytes.split(|b| *b == b',').collect();
    if mode == ParseMode::Strict && fields.len() != MAX_FIELDS {
        return Err(Error::InvalidCommand(format!(
            "expected {MAX_FIELDS} fields, got {}",
            fields.len()
        )));
    }

    let mut args = [0u64; MAX_FIELDS];
    for (slot, field) in args.iter_mut().zip(&fields) {
        match core::str::from_utf8(field).ok().and_then(parse_u64) {
            Some(value) => *slot = value,
            None if mode == ParseMode::Strict => {
                return Err(Error::InvalidCommand(format!(
                    "malformed field {:?}",
                    String::from_utf8_lossy(field)
                )));
            }
            None => warn!("coherent: field {:?} conversion failed", String::from_utf8_lossy(field)),
        }
    }

    let [pid, start, end, node] = args;
    if mode == ParseMode::Strict && start >= end {
        return Err(Error::InvalidCommand(format!("empty range {start:#x}-{end:#x}")));
    }
    Ok(MigrationRequest { pid, start, end, node: NodeId(node) })
}

/// Dispatches control commands to a [`MigrationController`].
pub struct ControlSurface {
    migration: MigrationController,
    mode: ParseMode,
}

impl ControlSurface {
    pub fn new(migration: MigrationController, mode: ParseMode) -> Self {
        Self { migration, mode }
    }

    /// Underlying controller.
    pub fn migration(&self) -> &MigrationController {
        &self.migration
    }

    /// Text parse mode.
    pub fn mode(&self) -> ParseMode {
        self.mode
    }

    /// Numeric command: migrates the mapping of `space` containing `addr`.
    pub fn ioctl(
        &self,
        space: &AddressSpace,
        cmd: u32,
        addr: u64,
    ) -> Result<Option<MigrationRequest>> {
        let command = ControlCommand::from_code(cmd).inspect_err(|_| {
            warn!("coherent: ioctl {cmd} rejected");
        })?;
        info!("coherent: ioctl {command:?} pid {} addr {addr:#x}", space.pid());
        self.migration.resolve_and_migrate(space, addr, command.tier())
    }

    /// Text command; returns the number of bytes consumed.
    pub fn write(&self, bytes: &[u8]) -> Result<usize> {
        let consumed = bytes.len().min(COMMAND_BUF_LEN - 1);
        let request = parse_command(bytes, self.mode)?;
        self.migration.migrate_range(&request)?;
        Ok(consumed)
    }

    /// Usage line.
    pub fn usage(&self) -> &'static str {
        USAGE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn req(pid: u64, start: u64, end: u64, node: u64) -> MigrationRequest {
        MigrationRequest { pid, start, end, node: NodeId(node) }
    }

    #[test]
    fn radix_follows_prefix() {
        assert_eq!(parse_u64("0x1f"), Some(31));
        assert_eq!(parse_u64("017"), Some(15));
        assert_eq!(parse_u64("0"), Some(0));
        assert_eq!(parse_u64("42\n"), Some(42));
        assert_eq!(parse_u64("09"), None);
        assert_eq!(parse_u64("0x"), None);
        assert_eq!(parse_u64(""), None);
        assert_eq!(parse_u64(" 1"), None);
        assert_eq!(parse_u64("18446744073709551616"), None);
    }

    #[test]
    fn four_fields() {
        assert_eq!(
            parse_command(b"100,4096,8192,2", ParseMode::Lenient).unwrap(),
            req(100, 4096, 8192, 2)
        );
        assert_eq!(
            parse_command(b"100,0x1000,0x2000,2\n", ParseMode::Strict).unwrap(),
            req(100, 0x1000, 0x2000, 2)
        );
    }

    #[test]
    fn lenient_defaults() {
        assert_eq!(parse_command(b"7", ParseMode::Lenient).unwrap(), req(7, 0, 0, 0));
        assert_eq!(parse_command(b"1,zz,3,4", ParseMode::Lenient).unwrap(), req(1, 0, 3, 4));
        assert_eq!(parse_command(b"1,2,3,4,5", ParseMode::Lenient).unwrap(), req(1, 2, 3, 4));
        assert_eq!(parse_command(b"", ParseMode::Lenient).unwrap(), req(0, 0, 0, 0));
    }

    #[test]
    fn strict_rejects() {
        for bad in [&b"7"[..], b"1,zz,3,4", b"1,2,3,4,5", b"1,8,8,2"] {
            assert!(matches!(parse_command(bad, ParseMode::Strict), Err(Error::InvalidCommand(_))));
        }
    }

    #[test]
    fn input_is_truncated_to_buffer() {
        let mut text = b"1,2,3,".to_vec();
        text.extend(std::iter::repeat(b'0').take(200));
        text.extend_from_slice(b"9");
        // The trailing 9 falls outside the buffer; the remaining run of zeros is octal 0.
        assert_eq!(parse_command(&text, ParseMode::Lenient).unwrap(), req(1, 2, 3, 0));
    }

    #[test]
    fn unknown_code_is_invalid() {
        assert!(matches!(ControlCommand::from_code(3), Err(Error::InvalidCommand(_))));
        assert_eq!(ControlCommand::from_code(1).unwrap().tier(), Tier::Coherent);
        assert_eq!(ControlCommand::from_code(2).unwrap().tier(), Tier::Default);
    }

    proptest! {
        #[test]
        fn any_radix_round_trips(
            pid in any::<u64>(),
            start in any::<u64>(),
            end in any::<u64>(),
            node in 0u64..8,
        ) {
            let text = format!("{pid},{start:#x},{end:#o},{node}\n");
            let text = text.replacen("0o", "0", 1);
            prop_assert_eq!(
                parse_command(text.as_bytes(), ParseMode::Lenient).unwrap(),
                req(pid, start, end, node)
            );
        }

        #[test]
        fn lenient_never_fails(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            prop_assert!(parse_command(&bytes, ParseMode::Lenient).is_ok());
        }
    }
}
