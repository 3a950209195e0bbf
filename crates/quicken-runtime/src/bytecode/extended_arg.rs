//! Operand extension
//!
//! `EXTENDED_ARG` units carry the high-order bytes of the next instruction's
//! operand. The accumulator lives only for the decode of one instruction:
//! `arg = (arg << 8) | byte` for every prefix, then once more for the final
//! unit's own byte.

use super::split;
use crate::error::{DecodeError, MAX_EXTENDED_ARGS};
use crate::opcode::Opcode;

const EXTENDED_ARG: u8 = Opcode::ExtendedArg as u8;

/// One decoded logical instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded {
    pub op: u8,
    /// Full operand, prefixes folded in.
    pub arg: u32,
    /// Index of the first unit (the first prefix, if any).
    pub start: usize,
    /// Index of the unit holding the opcode.
    pub site: usize,
    /// Index of the unit after this instruction.
    pub next: usize,
}

impl Decoded {
    pub fn prefixes(&self) -> usize {
        self.site - self.start
    }
}

/// Decode the instruction starting at `start` from a stream of `len` units.
#[inline]
pub fn decode_at(
    len: usize,
    load: impl Fn(usize) -> u16,
    start: usize,
) -> Result<Decoded, DecodeError> {
    if start >= len {
        return Err(DecodeError::Truncated { offset: start });
    }
    let mut arg: u32 = 0;
    let mut index = start;
    loop {
        let (op, byte) = split(load(index));
        arg = (arg << 8) | byte as u32;
        if op != EXTENDED_ARG {
            return Ok(Decoded {
                op,
                arg,
                start,
                site: index,
                next: index + 1,
            });
        }
        if index - start >= MAX_EXTENDED_ARGS {
            return Err(DecodeError::OperandOverflow { offset: index });
        }
        index += 1;
        if index >= len {
            return Err(DecodeError::DanglingExtendedArg { offset: index - 1 });
        }
    }
}

/// Decode from a plain slice of units.
pub fn decode_slice(units: &[u16], start: usize) -> Result<Decoded, DecodeError> {
    decode_at(units.len(), |i| units[i], start)
}

/// Number of prefixes needed for `arg`.
pub fn prefix_count(arg: u32) -> usize {
    match arg {
        0..=0xFF => 0,
        0x100..=0xFFFF => 1,
        0x1_0000..=0xFF_FFFF => 2,
        _ => 3,
    }
}

/// Units for `op` with operand `arg`, preceded by the prefixes it needs.
pub fn encode(op: u8, arg: u32) -> Vec<u16> {
    let prefixes = prefix_count(arg);
    let mut units = Vec::with_capacity(prefixes + 1);
    for shift in (1..=prefixes).rev() {
        let byte = (arg >> (8 * shift)) as u8;
        units.push(super::unit(EXTENDED_ARG, byte));
    }
    units.push(super::unit(op, arg as u8));
    units
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::unit;
    use proptest::prelude::*;

    const NOP: u8 = Opcode::Nop as u8;
    const LOAD_CONST: u8 = Opcode::LoadConst as u8;

    #[test]
    fn test_plain_operand() {
        let units = [unit(LOAD_CONST, 7)];
        let decoded = decode_slice(&units, 0).unwrap();
        assert_eq!(decoded.arg, 7);
        assert_eq!(decoded.next, 1);
        assert_eq!(decoded.prefixes(), 0);
    }

    #[test]
    fn test_fourth_prefix_overflows() {
        let mut units = vec![unit(EXTENDED_ARG, 1); 4];
        units.push(unit(NOP, 0));
        assert_eq!(
            decode_slice(&units, 0),
            Err(DecodeError::OperandOverflow { offset: 3 })
        );
    }

    #[test]
    fn test_dangling_prefix() {
        let units = [unit(NOP, 0), unit(EXTENDED_ARG, 1)];
        assert_eq!(
            decode_slice(&units, 1),
            Err(DecodeError::DanglingExtendedArg { offset: 1 })
        );
    }

    #[test]
    fn test_past_end_is_truncated() {
        let units = [unit(NOP, 0)];
        assert_eq!(
            decode_slice(&units, 1),
            Err(DecodeError::Truncated { offset: 1 })
        );
    }

    #[test]
    fn test_encode_sizes() {
        assert_eq!(encode(LOAD_CONST, 0xFF).len(), 1);
        assert_eq!(encode(LOAD_CONST, 0x100).len(), 2);
        assert_eq!(encode(LOAD_CONST, u32::MAX).len(), 4);
    }

    proptest! {
        #[test]
        fn prop_prefixes_concatenate_big_endian(
            bytes in proptest::collection::vec(any::<u8>(), 1..=4)
        ) {
            let (last, prefixes) = bytes.split_last().unwrap();
            let mut units: Vec<u16> = prefixes.iter().map(|&b| unit(EXTENDED_ARG, b)).collect();
            units.push(unit(LOAD_CONST, *last));

            let expected = bytes.iter().fold(0u32, |acc, &b| (acc << 8) | b as u32);
            let decoded = decode_slice(&units, 0).unwrap();
            prop_assert_eq!(decoded.arg, expected);
            prop_assert_eq!(decoded.op, LOAD_CONST);
            prop_assert_eq!(decoded.site, prefixes.len());
            prop_assert_eq!(decoded.next, units.len());
        }
    }
}
