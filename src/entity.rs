//! Persisted data model for the asset tree.
//!
//! Everything in the tree is one `Entity` row; its kind encodes the position:
//! plain folders and files, stack roots, per-viewport folders, and the
//! resolution variants below them. The kind is a proper enum in memory and a
//! stable tag string at rest, so the store can still prefix-filter on it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Position of an entity inside the asset tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityKind {
    /// Generic directory node.
    Folder,
    /// Leaf file: non-image or generic upload.
    File,
    /// Image upload in a format the resize pipeline does not support.
    PlainImage,
    /// Uploaded image not yet expanded into a stack.
    StackEmpty,
    /// Expanded stack; root of a variant subtree.
    Stack,
    /// One folder per viewport name of the usage's resize configuration.
    ViewportFolder { viewport: String },
    /// One file per (viewport, resolution-version) pair.
    VariantFile { viewport: String, version: String },
}

impl EntityKind {
    /// Stable tag string used for persistence and prefix filtering.
    pub fn tag(&self) -> String {
        match self {
            Self::Folder => "folder".to_string(),
            Self::File => "file".to_string(),
            Self::PlainImage => "file:plain-image".to_string(),
            Self::StackEmpty => "stack:empty".to_string(),
            Self::Stack => "stack".to_string(),
            Self::ViewportFolder { viewport } => format!("folder:{viewport}"),
            Self::VariantFile { viewport, version } => {
                format!("file:image:{viewport}:{version}")
            }
        }
    }

    /// Parse a tag string back into a kind.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "folder" => Some(Self::Folder),
            "file" => Some(Self::File),
            "file:plain-image" => Some(Self::PlainImage),
            "stack:empty" => Some(Self::StackEmpty),
            "stack" => Some(Self::Stack),
            other => {
                if let Some(rest) = other.strip_prefix("file:image:") {
                    let (viewport, version) = rest.split_once(':')?;
                    if viewport.is_empty() || version.is_empty() {
                        return None;
                    }
                    Some(Self::VariantFile {
                        viewport: viewport.to_string(),
                        version: version.to_string(),
                    })
                } else if let Some(viewport) = other.strip_prefix("folder:") {
                    if viewport.is_empty() {
                        return None;
                    }
                    Some(Self::ViewportFolder {
                        viewport: viewport.to_string(),
                    })
                } else {
                    None
                }
            }
        }
    }

    /// Whether this kind may sit at the root of a stack subtree.
    pub fn is_stack_root(&self) -> bool {
        matches!(self, Self::Stack | Self::StackEmpty)
    }

    /// Whether this kind contributes to folder byte aggregation.
    pub fn is_file_like(&self) -> bool {
        matches!(
            self,
            Self::File | Self::PlainImage | Self::StackEmpty | Self::Stack
        )
    }
}

impl Serialize for EntityKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.tag())
    }
}

impl<'de> Deserialize<'de> for EntityKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Self::from_tag(&tag)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown entity kind tag: {tag}")))
    }
}

/// Generation state of a stack root.
///
/// Transitions only along `Empty -> Pending -> {Finished | Error(_)}`; error
/// states are terminal and never retried automatically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackStatus {
    Empty,
    Pending,
    Finished,
    Error(String),
}

impl StackStatus {
    pub fn as_str(&self) -> String {
        match self {
            Self::Empty => "empty".to_string(),
            Self::Pending => "pending".to_string(),
            Self::Finished => "finished".to_string(),
            Self::Error(label) => format!("error: {label}"),
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "empty" => Some(Self::Empty),
            "pending" => Some(Self::Pending),
            "finished" => Some(Self::Finished),
            other => other
                .strip_prefix("error: ")
                .map(|label| Self::Error(label.to_string())),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Error(_))
    }
}

impl Serialize for StackStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_str())
    }
}

impl<'de> Deserialize<'de> for StackStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Self::parse(&value)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown stack status: {value}")))
    }
}

/// One row of the asset tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    /// Unique entity id.
    pub uuid: Uuid,
    /// Position in the asset tree.
    pub kind: EntityKind,
    /// Name, unique within one parent.
    pub name: String,
    /// Parent folder, None at the tree root.
    pub parent: Option<Uuid>,
    /// Stack root this entity descends from; None on roots themselves.
    pub root_uuid: Option<Uuid>,
    /// Materialized ancestor path, recomputed at creation only.
    pub local_path: String,
    /// File size, or aggregate descendant size for folders.
    pub bytes: i64,
    /// Declared content type of the original upload.
    pub content_type: Option<String>,
    /// Pixel width of the current image, when measurable.
    pub width: Option<u32>,
    /// Pixel height of the current image, when measurable.
    pub height: Option<u32>,
    /// Business context selecting the resize configuration.
    pub usage: Option<String>,
    /// Business resource that requested this asset.
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub resource_name: Option<String>,
    /// Generation state machine value; meaningful on stack roots.
    pub stack_status: Option<StackStatus>,
    /// Current source object for this entity, when one exists.
    pub storage_path: Option<String>,
    /// Preview object path; stable public name across overrides.
    pub preview_path: Option<String>,
    /// Monotonic source image generation counter, starts at 1.
    pub image_version: i32,
    /// Crop rectangle; all zero when uncropped.
    pub crop_offset_x: i32,
    pub crop_offset_y: i32,
    pub crop_width: i32,
    pub crop_height: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    /// Blank entity with the given kind and name; everything else defaulted.
    pub fn new(kind: EntityKind, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            uuid: Uuid::new_v4(),
            kind,
            name: name.into(),
            parent: None,
            root_uuid: None,
            local_path: String::new(),
            bytes: 0,
            content_type: None,
            width: None,
            height: None,
            usage: None,
            resource_type: None,
            resource_id: None,
            resource_name: None,
            stack_status: None,
            storage_path: None,
            preview_path: None,
            image_version: 1,
            crop_offset_x: 0,
            crop_offset_y: 0,
            crop_width: 0,
            crop_height: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Local path for a child of this entity: parent's path plus parent name.
    pub fn child_local_path(&self) -> String {
        if self.local_path.is_empty() {
            format!("/{}", self.name)
        } else {
            format!("{}/{}", self.local_path, self.name)
        }
    }

    /// Reset the crop rectangle to the uncropped state.
    pub fn clear_crop(&mut self) {
        self.crop_offset_x = 0;
        self.crop_offset_y = 0;
        self.crop_width = 0;
        self.crop_height = 0;
    }

    /// Active crop rectangle, None in the uncropped state.
    pub fn crop(&self) -> Option<CropRect> {
        if self.crop_width > 0 && self.crop_height > 0 {
            Some(CropRect {
                offset_x: self.crop_offset_x,
                offset_y: self.crop_offset_y,
                width: self.crop_width,
                height: self.crop_height,
            })
        } else {
            None
        }
    }
}

/// Crop rectangle requested by an override call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CropRect {
    pub offset_x: i32,
    pub offset_y: i32,
    pub width: i32,
    pub height: i32,
}
