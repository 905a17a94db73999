//! Hardware UID parsing and device-address derivation.

use {
    crate::error::{Error, Result},
    regex::Regex,
    serde::Serialize,
    std::fmt,
};

/// Default version byte folded into derived addresses.
pub const DEFAULT_VERSION_BYTE: u8 = 0xC0;

/// Three factory-programmed UID words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Uid {
    /// Words at the UID address, +4 and +8.
    pub words: [u32; 3],
}

impl Uid {
    /// Derive the device address with `version_byte`.
    pub fn derive_address(&self, version_byte: u8) -> DeviceAddress {
        let [u0, u1, u2] = self.words;
        derive_address(u0, u1, u2, version_byte)
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [u0, u1, u2] = self.words;
        write!(f, "{u0:08X}-{u1:08X}-{u2:08X}")
    }
}

/// Address derived from a UID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DeviceAddress {
    /// Raw 32-bit value.
    pub value: u32,
    /// Eight upper-case hex digits.
    pub hex: String,
    /// `XX:XX:XX:XX`.
    pub formatted: String,
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.formatted)
    }
}

/// Fold three UID words and the version byte into a device address.
///
/// The top byte of the XOR fold is kept, the second byte is replaced by
/// `version_byte`, and the low two bytes are kept.
pub fn derive_address(uid0: u32, uid1: u32, uid2: u32, version_byte: u8) -> DeviceAddress {
    let folded = uid0 ^ uid1 ^ uid2;
    let value = (folded & 0xFF00_FFFF) | (u32::from(version_byte) << 16);
    let hex = format!("{value:08X}");
    let formatted = hex
        .as_bytes()
        .chunks(2)
        .map(|pair| String::from_utf8_lossy(pair).into_owned())
        .collect::<Vec<_>>()
        .join(":");
    DeviceAddress {
        value,
        hex,
        formatted,
    }
}

/// Parse `count` consecutive words at `address` from a memory dump.
///
/// Accepts either all words on one line (`0x1fff7590: w0 w1 w2`) or one
/// line per word at `address`, `address + 4`, ... A space before the colon
/// and any hex case are accepted.
pub fn parse_words(output: &str, address: u32, count: usize) -> Result<Vec<u32>> {
    let single = Regex::new(&format!(
        r"(?i)0x0*{address:x}[ \t]*:((?:[ \t]+(?:0x)?[0-9a-f]{{8}}){{{count}}})"
    ))
    .map_err(|e| Error::Parse(e.to_string()))?;
    if let Some(caps) = single.captures(output) {
        return caps[1]
            .split_whitespace()
            .map(parse_hex_word)
            .collect();
    }

    (0..count)
        .map(|i| {
            let offset =
                u32::try_from(i * 4).map_err(|_| Error::Parse("word offset overflow".into()))?;
            let at = address.wrapping_add(offset);
            let line = Regex::new(&format!(r"(?i)0x0*{at:x}[ \t]*:[ \t]+((?:0x)?[0-9a-f]{{8}})"))
                .map_err(|e| Error::Parse(e.to_string()))?;
            line.captures(output)
                .ok_or_else(|| Error::Parse(format!("no word at 0x{at:08X} in memory dump")))
                .and_then(|caps| parse_hex_word(&caps[1]))
        })
        .collect()
}

fn parse_hex_word(word: &str) -> Result<u32> {
    let digits = word
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    u32::from_str_radix(digits, 16).map_err(|e| Error::Parse(format!("bad hex word `{word}`: {e}")))
}

/// Parse the three UID words at `address` from a memory dump.
pub fn parse_uid(output: &str, address: u32) -> Result<Uid> {
    let words = parse_words(output, address, 3)?;
    let mut uid = [0u32; 3];
    uid.copy_from_slice(&words);
    Ok(Uid { words: uid })
}
