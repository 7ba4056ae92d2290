use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub event_type: String,
    pub subject: String,
    pub body_html: Option<String>,
    pub body_text: Option<String>,
    pub variables: Vec<String>,
}

impl Template {
    pub fn html_key(&self) -> String {
        format!("{}.html", self.id)
    }

    pub fn text_key(&self) -> String {
        format!("{}.text", self.id)
    }

    pub fn subject_key(&self) -> String {
        format!("{}.subject", self.id)
    }
}
