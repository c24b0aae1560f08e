//! Scatter/gather byte mover
//!
//! Moves bytes between an ordered list of buffer segments and one
//! non-blocking stream, issuing one transfer per iteration sized to what is
//! left of the current segment.
//!
//! Partial progress always wins over a would-block or error report: a call
//! that moved any bytes returns `Ok(n)`, and `TryAgain`/`Io` are only ever
//! returned when nothing moved. The guest-pipe dispatcher treats any positive
//! count as forward progress and any error as terminal for that call.

use std::io::{self, Read, Write};

use tracing::trace;

use super::{PipeError, PipeResult};

/// Send the concatenation of `buffers` to `stream`.
pub fn send_buffers<W: Write + ?Sized>(stream: &mut W, buffers: &[&[u8]]) -> PipeResult<usize> {
    let mut moved = 0usize;

    for segment in buffers {
        let mut offset = 0usize;
        while offset < segment.len() {
            match stream.write(&segment[offset..]) {
                Ok(0) => return end_of_stream(moved),
                Ok(n) => {
                    offset += n;
                    moved += n;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return stop_on_error(moved, &e),
            }
        }
    }

    Ok(moved)
}

/// Receive into `buffers` from `stream`, filling segments in order.
pub fn recv_buffers<R: Read + ?Sized>(
    stream: &mut R,
    buffers: &mut [&mut [u8]],
) -> PipeResult<usize> {
    let mut moved = 0usize;

    for segment in buffers.iter_mut() {
        let mut offset = 0usize;
        while offset < segment.len() {
            match stream.read(&mut segment[offset..]) {
                Ok(0) => return end_of_stream(moved),
                Ok(n) => {
                    offset += n;
                    moved += n;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return stop_on_error(moved, &e),
            }
        }
    }

    Ok(moved)
}

fn end_of_stream(moved: usize) -> PipeResult<usize> {
    if moved == 0 {
        trace!("end of stream with nothing moved");
        Err(PipeError::Io)
    } else {
        Ok(moved)
    }
}

fn stop_on_error(moved: usize, err: &io::Error) -> PipeResult<usize> {
    if moved > 0 {
        return Ok(moved);
    }
    if err.kind() == io::ErrorKind::WouldBlock {
        Err(PipeError::TryAgain)
    } else {
        trace!("transfer failed: {}", err);
        Err(PipeError::Io)
    }
}
