//! Attachment intake: size and media-type policy, and the on-disk blob store
//! that turns an accepted payload into an [`AttachmentRef`].

use crate::chat::{AttachmentRef, MessageKind};
use crate::error::{ChatError, ChatResult};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};
use uuid::Uuid;

pub const DEFAULT_MAX_ATTACHMENT_BYTES: u64 = 10 * 1024 * 1024;
pub const DEFAULT_MAX_CAPTION_BYTES: u64 = 4 * 1024;
pub const DEFAULT_IMAGE_TYPES: &[&str] = &["image/png", "image/jpeg", "image/gif", "image/webp"];

/// What the uploader says the payload is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentRole {
    Image,
    File,
}

impl AttachmentRole {
    /// Used when the caller gave no hint.
    pub fn infer(mime: &str) -> Self {
        if mime.starts_with("image/") {
            AttachmentRole::Image
        } else {
            AttachmentRole::File
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentRole::Image => "image",
            AttachmentRole::File => "file",
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            AttachmentRole::Image => MessageKind::Image,
            AttachmentRole::File => MessageKind::File,
        }
    }
}

impl FromStr for AttachmentRole {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "image" => Ok(AttachmentRole::Image),
            "file" => Ok(AttachmentRole::File),
            other => Err(ChatError::Validation(format!(
                "unknown attachment kind: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Upload {
    pub role: AttachmentRole,
    pub file_name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct AttachmentPolicy {
    pub max_bytes: u64,
    pub max_caption_bytes: u64,
    pub image_types: Vec<String>,
}

impl Default for AttachmentPolicy {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_ATTACHMENT_BYTES,
            max_caption_bytes: DEFAULT_MAX_CAPTION_BYTES,
            image_types: DEFAULT_IMAGE_TYPES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl AttachmentPolicy {
    pub fn check_size(&self, size: u64) -> ChatResult<()> {
        if size > self.max_bytes {
            return Err(ChatError::PayloadTooLarge {
                size,
                limit: self.max_bytes,
            });
        }
        Ok(())
    }

    pub fn check_caption(&self, caption: &str) -> ChatResult<()> {
        let size = caption.len() as u64;
        if size > self.max_caption_bytes {
            return Err(ChatError::PayloadTooLarge {
                size,
                limit: self.max_caption_bytes,
            });
        }
        Ok(())
    }

    pub fn check(&self, upload: &Upload) -> ChatResult<()> {
        if upload.bytes.is_empty() {
            return Err(ChatError::Validation("attachment is empty".into()));
        }
        self.check_size(upload.bytes.len() as u64)?;

        if upload.role == AttachmentRole::Image {
            let mime = upload.mime.to_ascii_lowercase();
            if !self.image_types.iter().any(|allowed| *allowed == mime) {
                return Err(ChatError::UnsupportedMediaType(upload.mime.clone()));
            }
        }
        Ok(())
    }
}

/// Files live under `<root>/<chat_id>/<uuid>_<name>`.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn put(&self, chat_id: &str, upload: &Upload) -> Result<AttachmentRef> {
        let dir = self.root.join(sanitize(chat_id));
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create upload dir {}", dir.display()))?;

        let path = dir.join(format!(
            "{}_{}",
            Uuid::new_v4().simple(),
            sanitize(&upload.file_name)
        ));
        tokio::fs::write(&path, &upload.bytes)
            .await
            .with_context(|| format!("Failed to write attachment {}", path.display()))?;

        debug!(chat_id, path = %path.display(), size = upload.bytes.len(), "Stored attachment");

        Ok(AttachmentRef {
            path: path.to_string_lossy().to_string(),
            name: upload.file_name.clone(),
            size: upload.bytes.len() as u64,
            mime: upload.mime.clone(),
        })
    }

    pub async fn remove(&self, attachment: &AttachmentRef) {
        if let Err(e) = tokio::fs::remove_file(&attachment.path).await {
            warn!(path = %attachment.path, "Failed to remove orphaned attachment: {}", e);
        }
    }

    pub async fn remove_chat(&self, chat_id: &str) -> Result<()> {
        let dir = self.root.join(sanitize(chat_id));
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to remove upload dir {}", dir.display()))
            }
        }
    }
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned.to_string()
    }
}
