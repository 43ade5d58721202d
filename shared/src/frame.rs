/*!
Captured frame payloads.

The worker returns each capture as a base64 data URI. [`CapturedFrame`]
decodes it into raw image bytes and knows the file name it is written under.
*/

use crate::error::{Result, ScannerError};
use crate::protocol::CaptureReply;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::path::{Path, PathBuf};

/// A decoded image as returned by the camera
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedFrame {
    pub media_type: String,
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl CapturedFrame {
    /// Decode a `capture` reply
    pub fn from_reply(reply: &CaptureReply) -> Result<Self> {
        let (media_type, bytes) = decode_data_uri(&reply.image)?;
        Ok(Self {
            media_type,
            bytes,
            width: reply.width,
            height: reply.height,
        })
    }

    /// File extension matching the media type
    pub fn extension(&self) -> &'static str {
        match self.media_type.as_str() {
            "image/png" => "png",
            "image/tiff" => "tiff",
            "image/jpeg" => "jpg",
            "image/x-portable-graymap" => "pgm",
            _ => "bin",
        }
    }

    /// Path of this frame inside a scan directory; frames are 1-based on disk
    pub fn path_in(&self, dir: &Path, frame_index: u32) -> PathBuf {
        dir.join(frame_file_name(frame_index, self.extension()))
    }
}

/// `001.png`, `002.png`, ... for zero-based frame indices
pub fn frame_file_name(frame_index: u32, extension: &str) -> String {
    format!("{:03}.{}", frame_index + 1, extension)
}

/// Encode raw image bytes as a base64 data URI
pub fn encode_data_uri(media_type: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", media_type, STANDARD.encode(bytes))
}

/// Split a `data:<media type>;base64,<payload>` URI into its parts
pub fn decode_data_uri(uri: &str) -> Result<(String, Vec<u8>)> {
    let rest = uri
        .strip_prefix("data:")
        .ok_or_else(|| ScannerError::frame("image is not a data URI"))?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| ScannerError::frame("data URI has no payload separator"))?;
    let media_type = header
        .strip_suffix(";base64")
        .ok_or_else(|| ScannerError::frame("only base64 data URIs are supported"))?;

    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|e| ScannerError::frame(format!("invalid base64 payload: {}", e)))?;
    if bytes.is_empty() {
        return Err(ScannerError::frame("image payload is empty"));
    }

    let media_type = if media_type.is_empty() {
        "application/octet-stream".to_string()
    } else {
        media_type.to_string()
    };
    Ok((media_type, bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_capture_reply() {
        let reply = CaptureReply {
            image: encode_data_uri("image/png", &[0x89, b'P', b'N', b'G']),
            width: 640,
            height: 480,
        };
        let frame = CapturedFrame::from_reply(&reply).unwrap();

        assert_eq!(frame.media_type, "image/png");
        assert_eq!(frame.bytes, vec![0x89, b'P', b'N', b'G']);
        assert_eq!(frame.extension(), "png");
        assert_eq!(frame.path_in(Path::new("scans/x"), 0), PathBuf::from("scans/x/001.png"));
    }

    #[test]
    fn test_rejects_malformed_uris() {
        assert!(decode_data_uri("iVBORw0KGgo=").is_err());
        assert!(decode_data_uri("data:image/png;base64").is_err());
        assert!(decode_data_uri("data:image/png,plain").is_err());
        assert!(decode_data_uri("data:image/png;base64,!!!").is_err());
        assert!(decode_data_uri("data:image/png;base64,").is_err());
    }

    #[test]
    fn test_frame_file_names() {
        assert_eq!(frame_file_name(0, "pgm"), "001.pgm");
        assert_eq!(frame_file_name(71, "png"), "072.png");
    }
}
