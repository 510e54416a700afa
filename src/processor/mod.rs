//! Per-image processing: validate the upload, ask the description provider,
//! persist the result and charge for it.

pub mod batch;

use bytes::Bytes;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{info, warn};

use crate::api::metrics::{record_credits_deducted, record_description_failed, record_description_success};
use crate::config::UploadConfig;
use crate::db::{insert_description, ImageDescription, NewImageDescription};
use crate::ledger::{self, Ledger, LedgerError};
use crate::vision::{Description, DescriptionProvider, ImageInput, VisionError};

const MAX_FILENAME_LEN: usize = 255;

/// A file as received from a multipart upload
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub filename: String,
    pub content_type: Option<String>,
    pub data: Bytes,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ValidationError {
    #[error("File is empty")]
    Empty,

    #[error("File is {size} bytes, the limit is {max} bytes")]
    TooLarge { size: usize, max: usize },

    #[error("Unsupported file type: {0}")]
    UnsupportedType(String),

    #[error("File content is not a recognized image")]
    NotAnImage,

    #[error("File declared as {declared} but its content is {detected}")]
    ContentMismatch { declared: String, detected: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Vision(#[from] VisionError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// A stored description and the balance after charging for it.
/// `credits_remaining` is `None` when the charge is deferred.
#[derive(Debug, Clone)]
pub struct Processed {
    pub record: ImageDescription,
    pub credits_remaining: Option<i64>,
}

#[derive(Clone)]
pub struct Processor {
    db: SqlitePool,
    provider: Arc<dyn DescriptionProvider>,
    uploads: UploadConfig,
    credits_per_image: i64,
}

impl Processor {
    pub fn new(
        db: SqlitePool,
        provider: Arc<dyn DescriptionProvider>,
        uploads: UploadConfig,
        credits_per_image: i64,
    ) -> Self {
        Self {
            db,
            provider,
            uploads,
            credits_per_image,
        }
    }

    pub fn credits_per_image(&self) -> i64 {
        self.credits_per_image
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    pub fn validate(&self, file: &UploadedFile) -> Result<ImageInput, ValidationError> {
        validate_image(file, &self.uploads)
    }

    /// Validate, describe, then store and charge in one transaction.
    ///
    /// The balance is checked before the provider is called so a user without
    /// credits never triggers an external request.
    pub async fn process_one(&self, user_id: &str, file: &UploadedFile) -> Result<Processed, ProcessError> {
        let image = self.validate(file).inspect_err(|_| record_description_failed())?;

        let balance = ledger::balance(&self.db, user_id).await?;
        if balance < self.credits_per_image {
            return Err(LedgerError::InsufficientCredits {
                balance,
                required: self.credits_per_image,
            }
            .into());
        }

        let description = self.describe(&image).await?;
        self.persist(user_id, &image, &description, true).await
    }

    /// Call the provider on an already validated image
    pub async fn describe(&self, image: &ImageInput) -> Result<Description, ProcessError> {
        self.provider.describe(image).await.map_err(|e| {
            record_description_failed();
            ProcessError::from(e)
        })
    }

    /// Store a description; with `charge` the per-image cost is deducted in
    /// the same transaction, so a failed charge stores nothing.
    pub async fn persist(
        &self,
        user_id: &str,
        image: &ImageInput,
        description: &Description,
        charge: bool,
    ) -> Result<Processed, ProcessError> {
        let mut tx = self.db.begin().await?;

        let credits_remaining = if charge {
            let row = Ledger::new(&mut tx)
                .deduct(
                    user_id,
                    self.credits_per_image,
                    Some(&format!("Description of {}", image.filename)),
                )
                .await?;
            Some(row.balance_after)
        } else {
            None
        };

        let record = insert_description(
            &mut tx,
            &NewImageDescription {
                user_id,
                filename: &image.filename,
                description: &description.text,
                confidence: description.confidence,
                source: description.source.as_str(),
                file_size: image.data.len() as i64,
                mime_type: &image.mime_type,
            },
        )
        .await?;

        tx.commit().await?;

        record_description_success(description.source.as_str());
        if charge {
            record_credits_deducted(self.credits_per_image);
        }

        info!(
            user_id = %user_id,
            description_id = %record.id,
            filename = %record.filename,
            source = %record.source,
            credits_remaining = ?credits_remaining,
            "Image described"
        );

        Ok(Processed {
            record,
            credits_remaining,
        })
    }
}

/// Check size, declared type and magic bytes.
///
/// The declared type is the upload's content type, or a guess from the
/// filename when the client sent none or a generic one.
pub fn validate_image(file: &UploadedFile, uploads: &UploadConfig) -> Result<ImageInput, ValidationError> {
    let size = file.data.len();
    if size == 0 {
        return Err(ValidationError::Empty);
    }
    if size > uploads.max_file_size {
        return Err(ValidationError::TooLarge {
            size,
            max: uploads.max_file_size,
        });
    }

    let declared = file
        .content_type
        .as_deref()
        .map(normalize_mime)
        .filter(|ct| !ct.is_empty() && ct != "application/octet-stream")
        .or_else(|| {
            mime_guess::from_path(&file.filename)
                .first()
                .map(|m| normalize_mime(m.essence_str()))
        });

    let allowed = |mime: &str| uploads.allowed_types.iter().any(|t| t.eq_ignore_ascii_case(mime));

    if let Some(declared) = &declared {
        if !allowed(declared) {
            return Err(ValidationError::UnsupportedType(declared.clone()));
        }
    }

    let detected = sniff_image_type(&file.data).ok_or(ValidationError::NotAnImage)?;
    if !allowed(detected) {
        return Err(ValidationError::UnsupportedType(detected.to_string()));
    }

    if let Some(declared) = declared {
        if declared != detected {
            warn!(
                filename = %file.filename,
                declared = %declared,
                detected = %detected,
                "Upload content does not match declared type"
            );
            return Err(ValidationError::ContentMismatch {
                declared,
                detected: detected.to_string(),
            });
        }
    }

    Ok(ImageInput {
        filename: sanitize_filename(&file.filename),
        mime_type: detected.to_string(),
        data: file.data.clone(),
    })
}

fn normalize_mime(raw: &str) -> String {
    let essence = raw.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
    match essence.as_str() {
        "image/jpg" | "image/pjpeg" => "image/jpeg".to_string(),
        _ => essence,
    }
}

/// MIME type from the file signature
pub fn sniff_image_type(data: &[u8]) -> Option<&'static str> {
    if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if data.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some("image/png")
    } else if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        Some("image/gif")
    } else if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        Some("image/webp")
    } else {
        None
    }
}

/// Keep only the final path component of a client supplied name
fn sanitize_filename(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim()
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>();

    if base.is_empty() || base == "." || base == ".." {
        return "image".to_string();
    }
    if base.len() > MAX_FILENAME_LEN {
        let mut cut = MAX_FILENAME_LEN;
        while !base.is_char_boundary(cut) {
            cut -= 1;
        }
        return base[..cut].to_string();
    }
    base
}
