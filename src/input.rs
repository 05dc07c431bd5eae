//! Multi-modal input and its validation contract.
//!
//! Validation never panics and is never expressed as a core error type by
//! itself: the validator returns a structured issue list with per-field
//! codes, and the serving path wraps a non-empty list into
//! [`CacheError::InvalidInput`](crate::error::CacheError::InvalidInput).

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// A generation request before vectorization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MultiModalInput {
    /// Prompt text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Primary image bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<Vec<u8>>,
    /// Sketch bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sketch: Option<Vec<u8>>,
    /// Reference image blobs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reference_images: Vec<Vec<u8>>,
}

impl MultiModalInput {
    /// A text-only request.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    /// Attach a primary image.
    pub fn with_image(mut self, image: Vec<u8>) -> Self {
        self.image = Some(image);
        self
    }

    /// Attach a sketch.
    pub fn with_sketch(mut self, sketch: Vec<u8>) -> Self {
        self.sketch = Some(sketch);
        self
    }

    /// Attach a reference image.
    pub fn with_reference(mut self, reference: Vec<u8>) -> Self {
        self.reference_images.push(reference);
        self
    }

    /// Whether the request carries no modality at all.
    pub fn is_empty(&self) -> bool {
        self.text.is_none()
            && self.image.is_none()
            && self.sketch.is_none()
            && self.reference_images.is_empty()
    }
}

/// Structured validation issue codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueCode {
    EmptyInput,
    EmptyText,
    TextTooLong,
    InvalidCharacters,
    EmptyImage,
    ImageTooLarge,
    InvalidImageFormat,
    UnsupportedFormat,
    TooManyReferences,
}

/// One validation failure with the field it applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub code: IssueCode,
    pub field: String,
    pub message: String,
}

impl ValidationIssue {
    fn new(code: IssueCode, field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Validator limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    /// Maximum prompt length in characters
    pub max_text_length: usize,
    /// Maximum image size in bytes
    pub max_image_bytes: usize,
    /// Maximum reference image count
    pub max_reference_images: usize,
    /// Reference count that triggers a warning
    pub reference_warning_threshold: usize,
    /// Validation latency budget; exceeding it logs a warning
    #[serde(skip, default = "default_performance_target")]
    pub performance_target: Duration,
}

fn default_performance_target() -> Duration {
    Duration::from_millis(50)
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_text_length: 5000,
            max_image_bytes: 10 * 1024 * 1024,
            max_reference_images: 5,
            reference_warning_threshold: 3,
            performance_target: default_performance_target(),
        }
    }
}

/// Recognized image container formats, by magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImageFormat {
    Png,
    Jpeg,
    Webp,
}

fn sniff_format(bytes: &[u8]) -> Option<ImageFormat> {
    if bytes.starts_with(&[0x89, 0x50, 0x4E, 0x47]) {
        return Some(ImageFormat::Png);
    }
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some(ImageFormat::Jpeg);
    }
    if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return Some(ImageFormat::Webp);
    }
    None
}

/// Validates multi-modal inputs against the contract limits.
#[derive(Debug, Clone, Default)]
pub struct InputValidator {
    config: ValidatorConfig,
}

impl InputValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: ValidatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Validate a request. An empty issue list means the input is accepted.
    pub fn validate(&self, input: &MultiModalInput) -> Vec<ValidationIssue> {
        let started = Instant::now();
        let mut issues = Vec::new();

        if input.is_empty() {
            issues.push(ValidationIssue::new(
                IssueCode::EmptyInput,
                "input",
                "at least one modality is required",
            ));
        }

        if let Some(text) = &input.text {
            if text.trim().is_empty() {
                issues.push(ValidationIssue::new(
                    IssueCode::EmptyText,
                    "text",
                    "prompt text is blank",
                ));
            } else {
                let length = text.chars().count();
                if length > self.config.max_text_length {
                    issues.push(ValidationIssue::new(
                        IssueCode::TextTooLong,
                        "text",
                        format!(
                            "prompt is {length} characters, limit {}",
                            self.config.max_text_length
                        ),
                    ));
                }
                if text.chars().any(|c| ('\u{0000}'..='\u{001F}').contains(&c)) {
                    issues.push(ValidationIssue::new(
                        IssueCode::InvalidCharacters,
                        "text",
                        "prompt contains control characters",
                    ));
                }
            }
        }

        if let Some(image) = &input.image {
            self.check_image(image, "image", IssueCode::InvalidImageFormat, &mut issues);
        }
        if let Some(sketch) = &input.sketch {
            self.check_image(sketch, "sketch", IssueCode::InvalidImageFormat, &mut issues);
        }

        if input.reference_images.len() > self.config.max_reference_images {
            issues.push(ValidationIssue::new(
                IssueCode::TooManyReferences,
                "referenceImages",
                format!(
                    "{} reference images, limit {}",
                    input.reference_images.len(),
                    self.config.max_reference_images
                ),
            ));
        } else if input.reference_images.len() > self.config.reference_warning_threshold {
            warn!(
                count = input.reference_images.len(),
                "many reference images; composition quality may degrade"
            );
        }
        for (index, reference) in input.reference_images.iter().enumerate() {
            self.check_image(
                reference,
                &format!("referenceImages[{index}]"),
                IssueCode::UnsupportedFormat,
                &mut issues,
            );
        }

        let elapsed = started.elapsed();
        if elapsed > self.config.performance_target {
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                target_ms = self.config.performance_target.as_millis() as u64,
                "input validation exceeded its latency budget"
            );
        }
        issues
    }

    fn check_image(
        &self,
        bytes: &[u8],
        field: &str,
        format_code: IssueCode,
        issues: &mut Vec<ValidationIssue>,
    ) {
        if bytes.is_empty() {
            issues.push(ValidationIssue::new(
                IssueCode::EmptyImage,
                field,
                "image payload is empty",
            ));
            return;
        }
        if bytes.len() > self.config.max_image_bytes {
            issues.push(ValidationIssue::new(
                IssueCode::ImageTooLarge,
                field,
                format!(
                    "image is {} bytes, limit {}",
                    bytes.len(),
                    self.config.max_image_bytes
                ),
            ));
        }
        if sniff_format(bytes).is_none() {
            issues.push(ValidationIssue::new(
                format_code,
                field,
                "magic bytes are not PNG, JPEG, or WEBP",
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
    const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0];

    fn webp() -> Vec<u8> {
        let mut bytes = b"RIFF".to_vec();
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        bytes.extend_from_slice(b"WEBP");
        bytes
    }

    fn codes(issues: &[ValidationIssue]) -> Vec<IssueCode> {
        issues.iter().map(|issue| issue.code).collect()
    }

    #[test]
    fn test_valid_text_input() {
        let validator = InputValidator::new();
        assert!(validator
            .validate(&MultiModalInput::text("a red cat"))
            .is_empty());
    }

    #[test]
    fn test_empty_input() {
        let validator = InputValidator::new();
        let issues = validator.validate(&MultiModalInput::default());
        assert_eq!(codes(&issues), vec![IssueCode::EmptyInput]);
    }

    #[test]
    fn test_blank_text() {
        let validator = InputValidator::new();
        let issues = validator.validate(&MultiModalInput::text("   "));
        assert_eq!(codes(&issues), vec![IssueCode::EmptyText]);
    }

    #[test]
    fn test_text_too_long() {
        let validator = InputValidator::new();
        let issues = validator.validate(&MultiModalInput::text("x".repeat(5001)));
        assert_eq!(codes(&issues), vec![IssueCode::TextTooLong]);
    }

    #[test]
    fn test_control_characters() {
        let validator = InputValidator::new();
        let issues = validator.validate(&MultiModalInput::text("a red\x07cat"));
        assert_eq!(codes(&issues), vec![IssueCode::InvalidCharacters]);
    }

    #[test]
    fn test_image_formats_accepted() {
        let validator = InputValidator::new();
        for blob in [PNG.to_vec(), JPEG.to_vec(), webp()] {
            let issues =
                validator.validate(&MultiModalInput::text("a red cat").with_image(blob));
            assert!(issues.is_empty());
        }
    }

    #[test]
    fn test_invalid_image_magic() {
        let validator = InputValidator::new();
        let issues = validator
            .validate(&MultiModalInput::text("a red cat").with_image(vec![0x42, 0x4D, 0, 0]));
        assert_eq!(codes(&issues), vec![IssueCode::InvalidImageFormat]);
    }

    #[test]
    fn test_empty_image() {
        let validator = InputValidator::new();
        let issues = validator.validate(&MultiModalInput::text("a red cat").with_image(vec![]));
        assert_eq!(codes(&issues), vec![IssueCode::EmptyImage]);
    }

    #[test]
    fn test_image_too_large() {
        let validator = InputValidator::with_config(ValidatorConfig {
            max_image_bytes: 8,
            ..Default::default()
        });
        let mut blob = PNG.to_vec();
        blob.extend_from_slice(&[0u8; 16]);
        let issues = validator.validate(&MultiModalInput::text("a red cat").with_image(blob));
        assert_eq!(codes(&issues), vec![IssueCode::ImageTooLarge]);
    }

    #[test]
    fn test_too_many_references() {
        let validator = InputValidator::new();
        let mut input = MultiModalInput::text("a red cat");
        for _ in 0..6 {
            input = input.with_reference(PNG.to_vec());
        }
        let issues = validator.validate(&input);
        assert!(codes(&issues).contains(&IssueCode::TooManyReferences));
    }

    #[test]
    fn test_reference_bad_format_reported_per_index() {
        let validator = InputValidator::new();
        let input = MultiModalInput::text("a red cat")
            .with_reference(PNG.to_vec())
            .with_reference(vec![1, 2, 3, 4]);
        let issues = validator.validate(&input);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].code, IssueCode::UnsupportedFormat);
        assert_eq!(issues[0].field, "referenceImages[1]");
    }

    #[test]
    fn test_sketch_validated_like_image() {
        let validator = InputValidator::new();
        let issues =
            validator.validate(&MultiModalInput::text("a red cat").with_sketch(vec![0, 1]));
        assert_eq!(codes(&issues), vec![IssueCode::InvalidImageFormat]);
    }

    #[test]
    fn test_multiple_issues_accumulate() {
        let validator = InputValidator::new();
        let input = MultiModalInput {
            text: Some("  ".to_string()),
            image: Some(vec![]),
            sketch: None,
            reference_images: Vec::new(),
        };
        let issues = validator.validate(&input);
        assert_eq!(
            codes(&issues),
            vec![IssueCode::EmptyText, IssueCode::EmptyImage]
        );
    }
}
