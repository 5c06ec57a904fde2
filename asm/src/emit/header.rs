use crate::error::{AsmError, AsmResult};
use crate::pos::FilePos;

pub const HEADER_SIZE: u32 = 192;
pub const LOGO_OFFSET: usize = 0x04;
pub const LOGO_SIZE: usize = 156;
pub const TITLE_OFFSET: usize = 0xA0;
pub const TITLE_SIZE: usize = 12;
pub const GAME_CODE_OFFSET: usize = 0xAC;
pub const GAME_CODE_SIZE: usize = 4;
pub const MAKER_CODE_OFFSET: usize = 0xB0;
pub const MAKER_CODE_SIZE: usize = 2;
pub const CHECKSUM_OFFSET: usize = 0xBD;

/// Writes a caller-supplied 156 byte Nintendo logo bitmap into the header.
/// The assembler does not bundle the bitmap itself: `.logo` always takes a
/// path to a binary dump, read the same way `.embed` reads its payload.
pub fn patch_logo(buf: &mut [u8], base: usize, logo: &[u8; LOGO_SIZE], pos: &FilePos) -> AsmResult<()> {
    let start = base + LOGO_OFFSET;
    let end = start + LOGO_SIZE;
    if end > buf.len() {
        return Err(AsmError::Other(format!("{pos}: image too small to hold the cartridge header")));
    }
    buf[start..end].copy_from_slice(logo);
    Ok(())
}

/// Writes `title` left-justified and zero-padded/truncated to 12 bytes.
pub fn patch_title(buf: &mut [u8], base: usize, title: &str, pos: &FilePos) -> AsmResult<()> {
    if !title.is_ascii() {
        return Err(AsmError::Other(format!("{pos}: game title must be ASCII")));
    }
    if title.len() > TITLE_SIZE {
        return Err(AsmError::Other(format!(
            "{pos}: game title {title:?} is longer than {TITLE_SIZE} bytes"
        )));
    }
    let start = base + TITLE_OFFSET;
    let bytes = title.as_bytes();
    buf[start..start + bytes.len()].copy_from_slice(bytes);
    for b in &mut buf[start + bytes.len()..start + TITLE_SIZE] {
        *b = 0;
    }
    Ok(())
}

pub fn patch_game_code(buf: &mut [u8], base: usize, code: &str, pos: &FilePos) -> AsmResult<()> {
    if code.len() != GAME_CODE_SIZE || !code.is_ascii() {
        return Err(AsmError::Other(format!(
            "{pos}: game code must be exactly {GAME_CODE_SIZE} ASCII characters"
        )));
    }
    let start = base + GAME_CODE_OFFSET;
    buf[start..start + GAME_CODE_SIZE].copy_from_slice(code.as_bytes());
    Ok(())
}

/// Computes and writes the header checksum byte at 0xBD:
/// `-0x19 - sum(bytes[0xA0..0xBD])`, wrapping in `u8`.
pub fn patch_checksum(buf: &mut [u8], base: usize) {
    let start = base + TITLE_OFFSET;
    let end = base + CHECKSUM_OFFSET;
    let sum = buf[start..end].iter().fold(0u8, |acc, &b| acc.wrapping_sub(b));
    buf[base + CHECKSUM_OFFSET] = sum.wrapping_sub(0x19);
}

/// Re-derives the checksum and compares it against what's on disk; used by
/// the disassembler to flag a header that doesn't match its own payload.
#[must_use]
pub fn verify_checksum(buf: &[u8], base: usize) -> bool {
    let start = base + TITLE_OFFSET;
    let end = base + CHECKSUM_OFFSET;
    if buf.len() < base + HEADER_SIZE as usize {
        return false;
    }
    let expected = buf[start..end].iter().fold(0u8, |acc, &b| acc.wrapping_sub(b)).wrapping_sub(0x19);
    buf[base + CHECKSUM_OFFSET] == expected
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::rc::Rc;

    fn pos() -> FilePos {
        FilePos::new(Rc::from("t"), 1, 1)
    }

    #[test]
    fn checksum_round_trips_through_verify() {
        let mut buf = vec![0u8; HEADER_SIZE as usize];
        patch_title(&mut buf, 0, "GBAASM", &pos()).unwrap();
        patch_game_code(&mut buf, 0, "ABCD", &pos()).unwrap();
        patch_checksum(&mut buf, 0);
        assert!(verify_checksum(&buf, 0));
        buf[TITLE_OFFSET] ^= 0xFF;
        assert!(!verify_checksum(&buf, 0));
    }

    #[test]
    fn title_is_padded_with_zeroes() {
        let mut buf = vec![0xAAu8; HEADER_SIZE as usize];
        patch_title(&mut buf, 0, "HI", &pos()).unwrap();
        assert_eq!(&buf[TITLE_OFFSET..TITLE_OFFSET + 2], b"HI");
        assert_eq!(buf[TITLE_OFFSET + 2], 0);
    }

    #[test]
    fn oversized_title_is_rejected() {
        let mut buf = vec![0u8; HEADER_SIZE as usize];
        assert!(patch_title(&mut buf, 0, "WAY TOO LONG TITLE", &pos()).is_err());
    }
}
