//! Bidirectional byte pump between a relay client and the guest.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Bytes read per direction before they are written on.
pub const CHUNK_SIZE: usize = 4096;

/// Bytes forwarded in each direction of one relayed connection.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Transferred {
    /// Bytes copied from the client to the guest.
    pub to_guest: u64,
    /// Bytes copied from the guest to the client.
    pub to_client: u64,
}

/// Forwards bytes between `client` and `guest` until both directions have
/// finished.
///
/// End of stream on one side half-closes the other side's write half so
/// the opposite direction can still drain. An I/O error in either
/// direction, or cancellation of `shutdown`, ends both directions.
pub async fn pump(client: TcpStream, guest: TcpStream, shutdown: CancellationToken) -> Transferred {
    let pair = shutdown.child_token();
    let (client_read, client_write) = client.into_split();
    let (guest_read, guest_write) = guest.into_split();

    let (to_guest, to_client) = tokio::join!(
        copy_direction(client_read, guest_write, &pair, "client->guest"),
        copy_direction(guest_read, client_write, &pair, "guest->client"),
    );
    debug!(to_guest, to_client, "relayed connection closed");
    Transferred {
        to_guest,
        to_client,
    }
}

async fn copy_direction(
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    pair: &CancellationToken,
    direction: &'static str,
) -> u64 {
    let mut buf = [0_u8; CHUNK_SIZE];
    let mut copied: u64 = 0;
    loop {
        let read = tokio::select! {
            () = pair.cancelled() => return copied,
            result = reader.read(&mut buf) => result,
        };
        let count = match read {
            Ok(0) => break,
            Ok(count) => count,
            Err(err) => {
                debug!(direction, error = %err, "relay read failed");
                pair.cancel();
                return copied;
            }
        };
        let Some(chunk) = buf.get(..count) else {
            break;
        };
        let written = tokio::select! {
            () = pair.cancelled() => return copied,
            result = writer.write_all(chunk) => result,
        };
        if let Err(err) = written {
            debug!(direction, error = %err, "relay write failed");
            pair.cancel();
            return copied;
        }
        copied = copied.saturating_add(u64::try_from(count).unwrap_or(u64::MAX));
    }
    if let Err(err) = writer.shutdown().await {
        debug!(direction, error = %err, "relay half-close failed");
    }
    copied
}
