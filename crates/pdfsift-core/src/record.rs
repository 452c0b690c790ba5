use serde::Serialize;

/// One analysis result per admitted job. Every field degrades to an empty
/// string or inline error marker rather than going absent, so storage
/// backends always see the full shape.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ResultRecord {
    pub category: String,
    /// Document identity key (file name as submitted, conventionally a hash).
    pub pdf_key: String,
    /// Content key over the serialized tree.
    pub tree_key: String,
    pub tree: String,
    pub graph: String,
    pub obf_js: String,
    pub obf_js_sdhash: String,
    pub de_js: String,
    pub de_js_sdhash: String,
    pub swf: String,
    pub swf_sdhash: String,
    pub abc: String,
    pub abc_sdhash: String,
    pub actionscript: String,
    pub as_sdhash: String,
    pub shellcode: String,
    pub fsize: String,
    pub pdfsize: String,
    pub bin_blob: String,
    pub urls: String,
    pub malformed: String,
    pub errors: String,
}

impl ResultRecord {
    pub fn degraded(pdf_key: &str, category: &str, error: String) -> Self {
        Self {
            category: category.to_string(),
            pdf_key: pdf_key.to_string(),
            errors: error,
            ..Self::default()
        }
    }

    /// Error-only shadow of this record, used for the storage retry path.
    pub fn error_only(&self) -> Self {
        Self {
            category: self.category.clone(),
            pdf_key: self.pdf_key.clone(),
            errors: self.errors.clone(),
            ..Self::default()
        }
    }
}
