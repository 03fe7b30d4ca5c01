use rand::{distributions::Alphanumeric, Rng};
use tokio::net::TcpListener;

use crate::Result;

/// Generates an Azureus-style peer id: an 8-byte client prefix followed by
/// 12 random alphanumeric bytes.
pub fn generate_peer_id() -> [u8; 20] {
    let mut rng = rand::thread_rng();
    let mut peer_id = [0u8; 20];
    peer_id[..8].copy_from_slice(b"-RT0010-");
    for byte in peer_id[8..].iter_mut() {
        *byte = rng.sample(Alphanumeric);
    }
    peer_id
}

pub fn piece_size_from_idx(number_of_pieces: usize, total_length: u64, piece_length: u64, idx: u32) -> u64 {
    if idx as usize == number_of_pieces - 1 {
        let remainder = total_length % piece_length;
        if remainder == 0 {
            piece_length
        } else {
            remainder
        }
    } else {
        piece_length
    }
}

/// Claims a port to advertise to trackers. With no explicit port, the first
/// free one in the conventional 6881-6889 range is taken.
///
/// The listener is held open for the lifetime of the download so the port
/// stays ours, but inbound connections are never served: this client only
/// dials out.
pub async fn bind_listen_port(requested: Option<u16>) -> Result<(TcpListener, u16)> {
    if let Some(port) = requested {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        return Ok((listener, port));
    }

    let mut last_error = None;
    for port in 6881..=6889 {
        match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => return Ok((listener, port)),
            Err(e) => last_error = Some(e),
        }
    }

    Err(last_error
        .expect("bug: no bind attempts were made for the 6881-6889 range?")
        .into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_has_client_prefix_and_full_length() {
        let peer_id = generate_peer_id();
        assert_eq!(&peer_id[..8], b"-RT0010-");
        assert!(peer_id[8..].iter().all(|b| b.is_ascii_alphanumeric()));
    }

    #[test]
    fn last_piece_size_accounts_for_remainder() {
        assert_eq!(piece_size_from_idx(3, 70, 32, 0), 32);
        assert_eq!(piece_size_from_idx(3, 70, 32, 2), 6);
        // evenly divisible payload keeps the full piece length
        assert_eq!(piece_size_from_idx(2, 64, 32, 1), 32);
    }
}
