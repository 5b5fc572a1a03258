use crate::config::Storage;
use anyhow::{Context, Result};
use std::path::Path;
use walrus_pool::BlobId;

/// Read `file` and store it through the configured mirrors.
pub async fn upload(storage: &Storage, file: &Path, content_type: Option<&str>) -> Result<BlobId> {
    let payload = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let content_type = content_type.or_else(|| guess_content_type(file));
    tracing::info!(
        file = %file.display(),
        size = payload.len(),
        content_type = content_type.unwrap_or("unknown"),
        "Uploading document"
    );

    let pool = storage.mirror_pool()?;
    let result = pool.upload(payload, content_type).await;

    if let Err(error) = &result {
        for failure in error.failures() {
            tracing::debug!(mirror = %failure.mirror, error = %failure.error, "Mirror rejected upload");
        }
    }

    let blob_id = result.context("Failed to store document on any mirror")?;

    Ok(blob_id)
}

/// MIME type for the document formats students usually share.
fn guess_content_type(file: &Path) -> Option<&'static str> {
    let extension = file.extension()?.to_str()?.to_ascii_lowercase();

    let content_type = match extension.as_str() {
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "md" => "text/markdown",
        "html" | "htm" => "text/html",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "ppt" => "application/vnd.ms-powerpoint",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "zip" => "application/zip",
        _ => return None,
    };

    Some(content_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use tempfile::tempdir;
    use url::Url;

    #[test]
    fn guesses_content_type_from_extension() {
        assert_eq!(
            guess_content_type(Path::new("lecture.PDF")),
            Some("application/pdf")
        );
        assert_eq!(guess_content_type(Path::new("notes.md")), Some("text/markdown"));
        assert_eq!(guess_content_type(Path::new("archive.tar.xz")), None);
        assert_eq!(guess_content_type(Path::new("README")), None);
    }

    #[tokio::test]
    async fn uploads_file_with_guessed_content_type() {
        let mut failing = Server::new_async().await;
        let mut working = Server::new_async().await;
        failing
            .mock("PUT", "/v1/blobs")
            .match_query(Matcher::Any)
            .with_status(502)
            .create_async()
            .await;
        let mock = working
            .mock("PUT", "/v1/blobs")
            .match_query(Matcher::Any)
            .match_header("content-type", "application/pdf")
            .match_body("%PDF-1.7 notes")
            .with_status(200)
            .with_body(r#"{"newlyCreated":{"blobObject":{"blobId":"blob-1"}}}"#)
            .expect(1)
            .create_async()
            .await;

        let temp_dir = tempdir().unwrap();
        let file = temp_dir.path().join("notes.pdf");
        std::fs::write(&file, "%PDF-1.7 notes").unwrap();

        let storage = Storage {
            mirrors: vec![
                Url::parse(&failing.url()).unwrap(),
                Url::parse(&working.url()).unwrap(),
            ],
            epochs: 1,
        };

        let blob_id = upload(&storage, &file, None).await.unwrap();

        assert_eq!(blob_id.as_str(), "blob-1");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn all_mirrors_failing_names_the_last_reason() {
        let mut first = Server::new_async().await;
        let mut second = Server::new_async().await;
        first
            .mock("PUT", "/v1/blobs")
            .match_query(Matcher::Any)
            .with_status(500)
            .with_body("disk full")
            .create_async()
            .await;
        second
            .mock("PUT", "/v1/blobs")
            .match_query(Matcher::Any)
            .with_status(503)
            .with_body("maintenance")
            .create_async()
            .await;

        let temp_dir = tempdir().unwrap();
        let file = temp_dir.path().join("notes.txt");
        std::fs::write(&file, "notes").unwrap();

        let storage = Storage {
            mirrors: vec![
                Url::parse(&first.url()).unwrap(),
                Url::parse(&second.url()).unwrap(),
            ],
            epochs: 1,
        };

        let error = upload(&storage, &file, None).await.unwrap_err();

        let message = format!("{:#}", error);
        assert!(message.contains("Failed to store document on any mirror"));
        assert!(message.contains("maintenance"));
    }

    #[tokio::test]
    async fn missing_file_fails_before_any_request() {
        let storage = Storage {
            mirrors: vec![Url::parse("http://127.0.0.1:1").unwrap()],
            epochs: 1,
        };

        let error = upload(&storage, Path::new("/does/not/exist.pdf"), None)
            .await
            .unwrap_err();

        assert!(error.to_string().contains("Failed to read"));
    }
}
