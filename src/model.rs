use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ImageVariant {
    Original,
    Processed,
}

impl ImageVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageVariant::Original => "original",
            ImageVariant::Processed => "processed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "original" => Some(ImageVariant::Original),
            "processed" => Some(ImageVariant::Processed),
            _ => None,
        }
    }
}

/// Lifecycle of one background-removal request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ImageJobStatus {
    Queued,
    QueueFailed,
    Processing,
    Completed,
    Failed,
}

impl ImageJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageJobStatus::Queued => "queued",
            ImageJobStatus::QueueFailed => "queue_failed",
            ImageJobStatus::Processing => "processing",
            ImageJobStatus::Completed => "completed",
            ImageJobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(ImageJobStatus::Queued),
            "queue_failed" => Some(ImageJobStatus::QueueFailed),
            "processing" => Some(ImageJobStatus::Processing),
            "completed" => Some(ImageJobStatus::Completed),
            "failed" => Some(ImageJobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ImageJobStatus::Completed | ImageJobStatus::Failed)
    }
}

/// Lifecycle of one valuation-generation request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStatus::Pending => "pending",
            AnalysisStatus::Running => "running",
            AnalysisStatus::Completed => "completed",
            AnalysisStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(AnalysisStatus::Pending),
            "running" => Some(AnalysisStatus::Running),
            "completed" => Some(AnalysisStatus::Completed),
            "failed" => Some(AnalysisStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AnalysisStatus::Completed | AnalysisStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum QueueKind {
    ProcessImage,
    RunAnalysis,
}

impl QueueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKind::ProcessImage => "process_image",
            QueueKind::RunAnalysis => "run_analysis",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "process_image" => Some(QueueKind::ProcessImage),
            "run_analysis" => Some(QueueKind::RunAnalysis),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Book {
    pub id: i64,
    pub title: String,
    pub author: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookImage {
    pub id: i64,
    pub book_id: i64,
    pub s3_key: String,
    pub display_order: i64,
    pub is_primary: bool,
    pub is_garbage: bool,
    pub variant: ImageVariant,
    pub source_image_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageJob {
    pub id: i64,
    pub book_id: i64,
    pub image_id: i64,
    pub status: ImageJobStatus,
    pub attempt: i64,
    pub model_used: Option<String>,
    pub processed_image_id: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisJob {
    pub id: i64,
    pub book_id: i64,
    pub status: AnalysisStatus,
    pub model_id: String,
    pub error_message: Option<String>,
    pub truncated: bool,
    pub issue: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Low/mid/high estimate extracted from a generated report.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Valuation {
    pub low: Option<f64>,
    pub mid: Option<f64>,
    pub high: Option<f64>,
}

impl Valuation {
    pub fn is_empty(&self) -> bool {
        self.low.is_none() && self.mid.is_none() && self.high.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookAnalysis {
    pub book_id: i64,
    pub report: String,
    pub valuation: Valuation,
    pub model_id: String,
    pub truncated: bool,
    pub updated_at: DateTime<Utc>,
}

/// Options carried with each processing request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessingOptions {
    /// Segmentation models to try, in order. Empty means the configured list.
    #[serde(default)]
    pub models: Vec<String>,
    pub max_dimension: u32,
}

/// Queue payload for `QueueKind::ProcessImage`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessImageMessage {
    pub job_id: i64,
    pub book_id: i64,
    pub image_id: i64,
    pub source_key: String,
    pub options: ProcessingOptions,
}

/// Queue payload for `QueueKind::RunAnalysis`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunAnalysisMessage {
    pub job_id: i64,
    pub book_id: i64,
}
