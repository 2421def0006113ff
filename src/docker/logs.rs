//! Demuxing of Docker's multiplexed log stream
//!
//! When a container is created without a TTY, `GET /containers/{id}/logs`
//! returns frames of `[stream_type u8][0 0 0][len u32 BE][payload]`. The
//! orchestrator wants one combined transcript in arrival order, so stdout and
//! stderr payloads are concatenated as they appear.

/// Frame header length: type byte + 3 padding bytes + big-endian u32 length.
const HEADER_LEN: usize = 8;

/// Concatenate all frame payloads in stream order.
///
/// Tolerates a truncated trailing frame (a killed container can cut the
/// stream mid-frame); the partial payload is kept. Input that carries no
/// valid frame header at all is treated as a raw (TTY) stream and returned
/// as-is.
pub fn demux_combined(raw: &[u8]) -> String {
    if raw.is_empty() {
        return String::new();
    }
    // Stream type is 0 (stdin), 1 (stdout) or 2 (stderr); anything else in
    // the first byte means this is not a multiplexed stream.
    if raw[0] > 2 || raw.len() < HEADER_LEN {
        return String::from_utf8_lossy(raw).into_owned();
    }

    let mut out = Vec::with_capacity(raw.len());
    let mut pos = 0usize;
    while pos + HEADER_LEN <= raw.len() {
        let len = u32::from_be_bytes([raw[pos + 4], raw[pos + 5], raw[pos + 6], raw[pos + 7]])
            as usize;
        let start = pos + HEADER_LEN;
        let end = (start + len).min(raw.len());
        out.extend_from_slice(&raw[start..end]);
        pos = start + len;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(stream: u8, payload: &[u8]) -> Vec<u8> {
        let mut f = vec![stream, 0, 0, 0];
        f.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        f.extend_from_slice(payload);
        f
    }

    #[test]
    fn demuxes_interleaved_stdout_stderr_in_order() {
        let mut raw = frame(1, b"out1 ");
        raw.extend(frame(2, b"err1 "));
        raw.extend(frame(1, b"out2"));
        assert_eq!(demux_combined(&raw), "out1 err1 out2");
    }

    #[test]
    fn keeps_partial_payload_of_truncated_trailing_frame() {
        let mut raw = frame(1, b"complete ");
        let mut cut = frame(2, b"truncated payload");
        cut.truncate(cut.len() - 8);
        raw.extend(cut);
        assert_eq!(demux_combined(&raw), "complete truncated");
    }

    #[test]
    fn empty_input_is_empty() {
        assert_eq!(demux_combined(b""), "");
    }

    #[test]
    fn non_multiplexed_stream_passes_through() {
        let raw = b"plain tty output, no framing";
        assert_eq!(demux_combined(raw), "plain tty output, no framing");
    }

    #[test]
    fn zero_length_frames_are_skipped() {
        let mut raw = frame(1, b"");
        raw.extend(frame(2, b"only"));
        assert_eq!(demux_combined(&raw), "only");
    }
}
