use crate::emit::header::{self, HEADER_SIZE};
use crate::error::{AsmError, AsmResult};

/// Parsed view over the 192 byte GBA cartridge header, used by the
/// disassembler to report what a ROM's header actually says rather than
/// just its raw bytes.
pub struct CartridgeHeader {
    pub rom_entry_point: [u8; 4],
    pub nintendo_logo: [u8; 156],
    pub game_title: String,
    pub game_code: String,
    pub marker_code: String,
    pub fixed_value: u8,
    pub main_unit_code: u8,
    pub device_type: u8,
    pub software_version: u8,
    pub complement_check: u8,
    pub checksum_ok: bool,
    pub ram_entry_point: [u8; 4],
}

impl CartridgeHeader {
    pub fn new(data: &[u8]) -> AsmResult<Self> {
        if (data.len() as u32) < HEADER_SIZE {
            return Err(AsmError::Other(format!(
                "image is only {} bytes, shorter than the {HEADER_SIZE} byte cartridge header",
                data.len()
            )));
        }

        Ok(Self {
            rom_entry_point: Self::field::<4>(data, 0x000),
            nintendo_logo: Self::field::<156>(data, 0x004),
            game_title: Self::ascii_field(data, 0x0A0, 12),
            game_code: Self::ascii_field(data, 0x0AC, 4),
            marker_code: Self::ascii_field(data, 0x0B0, 2),
            fixed_value: data[0x0B2],
            main_unit_code: data[0x0B3],
            device_type: data[0x0B4],
            software_version: data[0x0BC],
            complement_check: data[0x0BD],
            checksum_ok: header::verify_checksum(data, 0),
            ram_entry_point: Self::field::<4>(data, 0x0C0),
        })
    }

    fn field<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&data[offset..offset + N]);
        out
    }

    fn ascii_field(data: &[u8], offset: usize, len: usize) -> String {
        String::from_utf8_lossy(&data[offset..offset + len]).trim_end_matches('\0').to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit::header as hdr;
    use crate::pos::FilePos;
    use pretty_assertions::assert_eq;
    use std::rc::Rc;

    #[test]
    fn reads_title_and_validates_checksum() {
        let mut buf = vec![0u8; HEADER_SIZE as usize];
        let pos = FilePos::new(Rc::from("t"), 1, 1);
        hdr::patch_title(&mut buf, 0, "FOO", &pos).unwrap();
        hdr::patch_checksum(&mut buf, 0);
        let header = CartridgeHeader::new(&buf).unwrap();
        assert_eq!(header.game_title, "FOO");
        assert!(header.checksum_ok);
    }

    #[test]
    fn rejects_truncated_images() {
        let buf = vec![0u8; 10];
        assert!(CartridgeHeader::new(&buf).is_err());
    }
}
