use crate::error::WorkflowError;
use marketflow_storage::TransactionRecord;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

const CSV_HEADER: [&str; 9] = [
    "id",
    "job_id",
    "bid_id",
    "amount_minor",
    "commission_minor",
    "commission_rate_bps",
    "status",
    "created_at",
    "updated_at",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Json,
    Csv,
}

impl ExportFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Csv => "text/csv",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = WorkflowError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            other => Err(WorkflowError::InvalidInput(format!(
                "unsupported export format '{other}', expected json or csv"
            ))),
        }
    }
}

/// Rendered export body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportDocument {
    pub format: ExportFormat,
    pub body: String,
    pub rows: usize,
}

impl ExportDocument {
    pub fn content_type(&self) -> &'static str {
        self.format.content_type()
    }
}

pub fn render(
    format: ExportFormat,
    transactions: &[TransactionRecord],
) -> Result<ExportDocument, WorkflowError> {
    let body = match format {
        ExportFormat::Json => serde_json::to_string(transactions)
            .map_err(|e| WorkflowError::StoreFailure(format!("export encoding failed: {e}")))?,
        ExportFormat::Csv => render_csv(transactions),
    };
    Ok(ExportDocument {
        format,
        body,
        rows: transactions.len(),
    })
}

fn render_csv(transactions: &[TransactionRecord]) -> String {
    let mut out = CSV_HEADER.join(",");
    out.push_str("\r\n");
    for tx in transactions {
        let fields = [
            tx.id.clone(),
            tx.job_id.clone(),
            tx.bid_id.clone().unwrap_or_default(),
            tx.amount_minor.to_string(),
            tx.commission_minor.to_string(),
            tx.commission_rate_bps.to_string(),
            tx.status.as_str().to_string(),
            tx.created_at.to_rfc3339(),
            tx.updated_at.to_rfc3339(),
        ];
        let line = fields
            .iter()
            .map(|field| csv_field(field))
            .collect::<Vec<_>>()
            .join(",");
        out.push_str(&line);
        out.push_str("\r\n");
    }
    out
}

/// RFC 4180 quoting: wrap when the field holds a delimiter, quote, or line break.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\r', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
