//! Just enough of the contract ABI encoding to talk to the voting contract.
//!
//! Every value occupies one 32-byte word in the head; dynamic values (`bytes`,
//! `string`) store an offset in the head and their length-prefixed,
//! zero-padded contents in the tail.

use crate::model::address::WalletAddress;
use crate::signature::keccak256;

const WORD: usize = 32;

/// The 4-byte function selector for a canonical signature such as
/// `"vote(uint256,bytes32,bytes)"`.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// A value to encode as a call argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Uint(u64),
    Address(WalletAddress),
    FixedBytes([u8; 32]),
    Bytes(Vec<u8>),
}

/// Encode a call to the function with the given selector.
pub fn encode_call(selector: [u8; 4], args: &[Token]) -> Vec<u8> {
    let mut head = Vec::with_capacity(args.len() * WORD);
    let mut tail = Vec::new();
    let head_len = args.len() * WORD;

    for arg in args {
        match arg {
            Token::Uint(n) => head.extend_from_slice(&uint_word(*n)),
            Token::Address(address) => {
                let mut word = [0u8; WORD];
                word[12..].copy_from_slice(address.as_bytes());
                head.extend_from_slice(&word);
            }
            Token::FixedBytes(bytes) => head.extend_from_slice(bytes),
            Token::Bytes(bytes) => {
                head.extend_from_slice(&uint_word((head_len + tail.len()) as u64));
                tail.extend_from_slice(&uint_word(bytes.len() as u64));
                tail.extend_from_slice(bytes);
                let padding = (WORD - bytes.len() % WORD) % WORD;
                tail.resize(tail.len() + padding, 0);
            }
        }
    }

    let mut out = Vec::with_capacity(4 + head.len() + tail.len());
    out.extend_from_slice(&selector);
    out.extend_from_slice(&head);
    out.extend_from_slice(&tail);
    out
}

fn uint_word(n: u64) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    word[WORD - 8..].copy_from_slice(&n.to_be_bytes());
    word
}

/// Reads values out of ABI-encoded return data.
pub struct Decoder<'a> {
    data: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn word_at(&self, offset: usize) -> Result<&'a [u8], String> {
        offset
            .checked_add(WORD)
            .and_then(|end| self.data.get(offset..end))
            .ok_or_else(|| format!("return data truncated at byte {offset}"))
    }

    fn uint_at(&self, offset: usize) -> Result<u64, String> {
        let word = self.word_at(offset)?;
        if word[..WORD - 8].iter().any(|b| *b != 0) {
            return Err(format!("integer at byte {offset} does not fit in 64 bits"));
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&word[WORD - 8..]);
        Ok(u64::from_be_bytes(bytes))
    }

    /// The `index`th head value as an unsigned integer.
    pub fn uint(&self, index: usize) -> Result<u64, String> {
        self.uint_at(index * WORD)
    }

    /// The `index`th head value as a boolean.
    pub fn boolean(&self, index: usize) -> Result<bool, String> {
        match self.uint(index)? {
            0 => Ok(false),
            1 => Ok(true),
            n => Err(format!("value {n} at index {index} is not a boolean")),
        }
    }

    /// The `index`th head value as a dynamic UTF-8 string.
    pub fn string(&self, index: usize) -> Result<String, String> {
        let offset = usize::try_from(self.uint(index)?)
            .map_err(|_| format!("string offset at index {index} is too large"))?;
        let len = usize::try_from(self.uint_at(offset)?)
            .map_err(|_| format!("string length at index {index} is too large"))?;
        let start = offset + WORD;
        let bytes = start
            .checked_add(len)
            .and_then(|end| self.data.get(start..end))
            .ok_or_else(|| format!("string at index {index} is truncated"))?;
        String::from_utf8(bytes.to_vec()).map_err(|_| format!("string at index {index} is not UTF-8"))
    }
}

#[cfg(test)]
mod tests {
    use data_encoding::HEXLOWER;

    use super::*;

    #[test]
    fn known_selectors() {
        assert_eq!(selector("transfer(address,uint256)"), [0xa9, 0x05, 0x9c, 0xbb]);
        assert_eq!(selector("balanceOf(address)"), [0x70, 0xa0, 0x82, 0x31]);
    }

    #[test]
    fn encode_static_and_dynamic() {
        let data = encode_call(
            [0xde, 0xad, 0xbe, 0xef],
            &[
                Token::Uint(7),
                Token::FixedBytes([0x11; 32]),
                Token::Bytes(vec![0xaa; 33]),
            ],
        );
        let body = &data[4..];
        assert_eq!(&data[..4], &[0xde, 0xad, 0xbe, 0xef]);
        // Three head words, then a length word and two words of content.
        assert_eq!(body.len(), 6 * WORD);
        assert_eq!(body[WORD - 1], 7);
        assert_eq!(&body[WORD..2 * WORD], &[0x11; 32]);
        assert_eq!(body[3 * WORD - 1], 0x60); // Offset of the tail.
        assert_eq!(body[4 * WORD - 1], 33); // Length.
        assert_eq!(&body[4 * WORD..4 * WORD + 33], &[0xaa; 33][..]);
        assert!(body[4 * WORD + 33..].iter().all(|b| *b == 0));
    }

    #[test]
    fn encode_address() {
        let address: WalletAddress = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266".parse().unwrap();
        let data = encode_call(selector("getVoterInfo(address)"), &[Token::Address(address)]);
        assert_eq!(
            HEXLOWER.encode(&data[4..]),
            "000000000000000000000000f39fd6e51aad88f6f4ce6ab8827279cfffb92266"
        );
    }

    #[test]
    fn decode_mixed_tuple() {
        // (uint256 5, string "TI", bool true)
        let mut data = Vec::new();
        data.extend_from_slice(&uint_word(5));
        data.extend_from_slice(&uint_word(0x60));
        data.extend_from_slice(&uint_word(1));
        data.extend_from_slice(&uint_word(2));
        let mut text = [0u8; WORD];
        text[..2].copy_from_slice(b"TI");
        data.extend_from_slice(&text);

        let decoder = Decoder::new(&data);
        assert_eq!(decoder.uint(0), Ok(5));
        assert_eq!(decoder.string(1), Ok("TI".to_string()));
        assert_eq!(decoder.boolean(2), Ok(true));
    }

    #[test]
    fn decode_rejects_bad_data() {
        let data = uint_word(2);
        let decoder = Decoder::new(&data);
        assert!(decoder.uint(1).is_err());
        assert!(decoder.boolean(0).is_err());
        // Offset points past the end.
        assert!(decoder.string(0).is_err());

        let mut huge = [0xffu8; WORD];
        huge[0] = 1;
        assert!(Decoder::new(&huge).uint(0).is_err());
    }
}
