use serde::Serialize;

/// Envelope for every ops API body.
#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<PageMeta>,
}

/// Listing endpoints return at most `limit` entries, newest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageMeta {
    pub count: usize,
    pub limit: usize,
    pub truncated: bool,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T, message: String) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            message,
            page: None,
        }
    }

    pub fn error(error: String, message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            message,
            page: None,
        }
    }
}

impl<T> ApiResponse<Vec<T>> {
    /// Wraps a listing capped at `limit`. A full page may have more behind it.
    pub fn page(items: Vec<T>, limit: usize, message: String) -> Self {
        let count = items.len();
        Self {
            page: Some(PageMeta {
                count,
                limit,
                truncated: count >= limit,
            }),
            ..Self::success(items, message)
        }
    }
}
