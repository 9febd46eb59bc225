//! Upload request validation.
//!
//! Everything here runs before any store call.  Structural limits are
//! declared with `garde`; the filename character and reserved-name rules
//! are checked by hand.

use serde::Deserialize;

use crate::errors::UploadError;

pub const MAX_FILENAME_LENGTH: usize = 255;
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Body of `POST /files/upload-url`.
#[derive(Debug, Clone, Deserialize, garde::Validate)]
#[serde(rename_all = "camelCase")]
pub struct UploadUrlRequest {
    #[garde(length(max = 255))]
    pub filename: String,

    /// Declared size in bytes; absent means a single-shot upload.
    #[garde(skip)]
    #[serde(default)]
    pub size: Option<i64>,

    #[garde(length(max = 255), pattern(r"^[A-Za-z0-9][A-Za-z0-9_.+-]*/[A-Za-z0-9_.+-]+$"))]
    #[serde(default, alias = "content_type", alias = "mime_type")]
    pub content_type: Option<String>,
}

/// A request that passed every check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedUpload {
    pub filename: String,
    pub size: Option<u64>,
    pub content_type: String,
}

/// Validate a filename.
///
/// Rules:
/// - Required and at most 255 bytes
/// - No `< > : " / \ | ? *` and no control characters
/// - Not a reserved device name (`CON`, `NUL`, `COM1`, ...) regardless
///   of case or extension
pub fn validate_filename(filename: &str) -> Result<(), UploadError> {
    if filename.is_empty() {
        return Err(UploadError::validation(
            "FILENAME_REQUIRED",
            "filename",
            "Filename is required",
        ));
    }

    if filename.len() > MAX_FILENAME_LENGTH {
        return Err(UploadError::validation(
            "INVALID_FILENAME",
            "filename",
            format!("Filename must be at most {MAX_FILENAME_LENGTH} characters"),
        ));
    }

    if filename
        .chars()
        .any(|c| matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*') || c < ' ')
    {
        return Err(UploadError::validation(
            "INVALID_FILENAME",
            "filename",
            "Filename contains invalid characters",
        ));
    }

    let base = match filename.rfind('.') {
        Some(idx) => &filename[..idx],
        None => filename,
    };
    if let Some(reserved) = RESERVED_NAMES
        .iter()
        .find(|r| r.eq_ignore_ascii_case(base))
    {
        return Err(UploadError::validation(
            "INVALID_FILENAME",
            "filename",
            format!("'{reserved}' is a reserved filename"),
        ));
    }

    Ok(())
}

/// Validate a declared size against `max_file_size`.
pub fn validate_size(size: Option<i64>, max_file_size: u64) -> Result<Option<u64>, UploadError> {
    let Some(size) = size else {
        return Ok(None);
    };
    if size <= 0 {
        return Err(UploadError::validation(
            "INVALID_SIZE",
            "size",
            "File size must be greater than 0",
        ));
    }
    let size = size as u64;
    if size > max_file_size {
        return Err(UploadError::validation(
            "FILE_TOO_LARGE",
            "size",
            format!("File size exceeds the maximum of {max_file_size} bytes"),
        ));
    }
    Ok(Some(size))
}

fn from_report(report: garde::Report) -> UploadError {
    let (field, code, message) = match report.iter().next() {
        Some((path, error)) => {
            let path = path.to_string();
            if path.starts_with("content_type") {
                ("content_type", "INVALID_FILE_TYPE", error.to_string())
            } else {
                ("filename", "INVALID_FILENAME", error.to_string())
            }
        }
        None => ("filename", "INVALID_FILENAME", report.to_string()),
    };
    UploadError::validation(code, field, message)
}

impl UploadUrlRequest {
    /// Run every check and normalize the request.
    pub fn validate_upload(self, max_file_size: u64) -> Result<ValidatedUpload, UploadError> {
        validate_filename(&self.filename)?;
        garde::Validate::validate(&self).map_err(from_report)?;
        let size = validate_size(self.size, max_file_size)?;

        Ok(ValidatedUpload {
            filename: self.filename,
            size,
            content_type: self
                .content_type
                .filter(|ct| !ct.is_empty())
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: u64 = 50 * 1024 * 1024 * 1024;

    fn detail(err: UploadError) -> &'static str {
        match err {
            UploadError::Validation { code, .. } => code,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    fn request(filename: &str, size: Option<i64>, content_type: Option<&str>) -> UploadUrlRequest {
        UploadUrlRequest {
            filename: filename.to_string(),
            size,
            content_type: content_type.map(str::to_string),
        }
    }

    #[test]
    fn test_valid_filenames() {
        assert!(validate_filename("video.mp4").is_ok());
        assert!(validate_filename("my report (final).pdf").is_ok());
        assert!(validate_filename("console.log").is_ok());
        assert!(validate_filename(&"a".repeat(255)).is_ok());
    }

    #[test]
    fn test_invalid_filenames() {
        assert_eq!(detail(validate_filename("").unwrap_err()), "FILENAME_REQUIRED");
        assert_eq!(
            detail(validate_filename(&"a".repeat(256)).unwrap_err()),
            "INVALID_FILENAME"
        );
        for bad in ["a/b.txt", "a\\b", "what?.txt", "x\u{1}y", "star*.png", "pipe|.txt"] {
            assert_eq!(detail(validate_filename(bad).unwrap_err()), "INVALID_FILENAME", "{bad}");
        }
    }

    #[test]
    fn test_reserved_names() {
        assert!(validate_filename("CON").is_err());
        assert!(validate_filename("nul.txt").is_err());
        assert!(validate_filename("Lpt9.tar").is_err());
        assert!(validate_filename("COM10").is_ok());
    }

    #[test]
    fn test_validate_size() {
        assert_eq!(validate_size(None, MAX).unwrap(), None);
        assert_eq!(validate_size(Some(100), MAX).unwrap(), Some(100));
        assert_eq!(detail(validate_size(Some(0), MAX).unwrap_err()), "INVALID_SIZE");
        assert_eq!(detail(validate_size(Some(-5), MAX).unwrap_err()), "INVALID_SIZE");
        assert_eq!(
            detail(validate_size(Some(MAX as i64 + 1), MAX).unwrap_err()),
            "FILE_TOO_LARGE"
        );
    }

    #[test]
    fn test_content_type_defaults() {
        let upload = request("note.txt", Some(100), None)
            .validate_upload(MAX)
            .unwrap();
        assert_eq!(upload.content_type, "application/octet-stream");
        assert_eq!(upload.size, Some(100));
    }

    #[test]
    fn test_content_type_shape() {
        for ok in ["image/svg+xml", "video/mp4", "application/vnd.ms-excel", "text/x_custom"] {
            let upload = request("a.bin", None, Some(ok)).validate_upload(MAX).unwrap();
            assert_eq!(upload.content_type, ok);
        }
        let err = request("a.txt", None, Some("not a mime"))
            .validate_upload(MAX)
            .unwrap_err();
        assert_eq!(detail(err), "INVALID_FILE_TYPE");
    }

    #[test]
    fn test_deserialize_aliases() {
        let req: UploadUrlRequest =
            serde_json::from_str(r#"{"filename":"a.txt","content_type":"text/plain"}"#).unwrap();
        assert_eq!(req.content_type.as_deref(), Some("text/plain"));
        assert_eq!(req.size, None);
    }
}
