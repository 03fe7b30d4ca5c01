use bytes::Buf;
use std::io::Cursor;
use tokio::io::AsyncWriteExt;

use crate::{Decode, Encode, Error, Result};

/// The handshake is a required message and must be the first message
/// transmitted by either side of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Eight reserved bytes used to advertise protocol extensions.
    /// This client supports none and always sends zeroes.
    pub reserved: u64,
    /// 20-byte SHA1 hash of the info dictionary of the metainfo file
    pub info_hash: [u8; 20],
    /// 20-byte unique ID of the remote client
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// pstr length byte + pstr + reserved + info_hash + peer_id
    pub const LENGTH: usize = 1 + Self::PSTR.len() + 8 + 20 + 20;
    pub const PSTR: &'static str = "BitTorrent protocol";

    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Handshake {
            reserved: 0,
            info_hash,
            peer_id,
        }
    }
}

impl Encode for Handshake {
    async fn encode<T>(&self, dst: &mut T) -> Result<()>
    where
        T: AsyncWriteExt + Unpin,
    {
        dst.write_all(&[Self::PSTR.len() as u8]).await?;
        dst.write_all(Self::PSTR.as_bytes()).await?;
        dst.write_all(&self.reserved.to_be_bytes()).await?;
        dst.write_all(self.info_hash.as_ref()).await?;
        dst.write_all(&self.peer_id).await?;

        Ok(())
    }
}

impl<'a> Decode<'a> for Handshake {
    fn decode(src: &'a [u8]) -> Result<Self> {
        check_length!(src.len(), Self::LENGTH);

        let mut src = Cursor::new(src);

        let pstr_len = src.get_u8() as usize;
        if pstr_len != Self::PSTR.len() {
            return Err(Error::BadHandshake("unexpected protocol string length"));
        }

        let offset = src.position() as usize;
        if &src.get_ref()[offset..offset + pstr_len] != Self::PSTR.as_bytes() {
            return Err(Error::BadHandshake("unexpected protocol string"));
        }
        src.set_position((offset + pstr_len) as u64);

        let reserved = src.get_u64();

        let mut info_hash = [0; 20];
        src.copy_to_slice(info_hash.as_mut());

        let mut peer_id = [0; 20];
        src.copy_to_slice(peer_id.as_mut());

        Ok(Handshake {
            reserved,
            info_hash,
            peer_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn encode_to_vec(handshake: &Handshake) -> Vec<u8> {
        let mut buf = Vec::new();
        handshake.encode(&mut buf).await.expect("encoding failed");
        buf
    }

    #[tokio::test]
    async fn handshake_roundtrip() {
        let handshake = Handshake::new([7; 20], *b"-RT0100-abcdefghijkl");

        let encoded = encode_to_vec(&handshake).await;
        assert_eq!(encoded.len(), Handshake::LENGTH);
        assert_eq!(encoded[0], 19);

        let decoded = Handshake::decode(&encoded).expect("decoding failed");
        assert_eq!(decoded, handshake);
    }

    #[tokio::test]
    async fn handshake_rejects_wrong_pstr() {
        let handshake = Handshake::new([7; 20], [1; 20]);
        let mut encoded = encode_to_vec(&handshake).await;
        encoded[1] = b'b';

        assert!(matches!(
            Handshake::decode(&encoded),
            Err(Error::BadHandshake(_))
        ));
    }

    #[test]
    fn handshake_rejects_short_input() {
        assert!(matches!(
            Handshake::decode(&[19; 10]),
            Err(Error::BadLength(10, Handshake::LENGTH))
        ));
    }
}
