//! Read loop shared by client and server connections.

use tokio::io::AsyncRead;

use crate::cancel::CancellationToken;
use crate::error::{PipeRpcError, Result};
use crate::protocol::{FrameHandler, PacketReader};

/// Dispatch packets to `handler` until the call ends.
///
/// Returns `Ok(())` when a `Trailers` frame has been handled, when the peer
/// closes the stream, or when `stop` fires. Protocol and I/O errors are
/// returned to the caller, which tears the connection down either way.
pub(crate) async fn read_loop<R>(
    reader: &mut PacketReader<R>,
    handler: &dyn FrameHandler,
    stop: &CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let more = tokio::select! {
            biased;
            _ = stop.cancelled() => return Ok(()),
            more = reader.read(handler) => more,
        };
        match more {
            Ok(true) => continue,
            Ok(false) => return Ok(()),
            Err(PipeRpcError::EndOfStream) => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}
