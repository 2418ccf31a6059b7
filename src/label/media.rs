//! Frame encoding for labeling requests.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha2::{Digest, Sha256};

use crate::clip::{ClipSample, Window, WindowKind};
use crate::digest::hex_prefix;
use crate::error::{Outcome, Skip, SkipReason};

/// One window's frames as `data:` URLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedClip {
    pub kind: WindowKind,
    pub data_urls: Vec<String>,
}

/// Every window included in a request, plus the content fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedMedia {
    pub clips: Vec<EncodedClip>,
    /// SHA-256 over every included frame's bytes, in window order.
    pub fingerprint: String,
}

impl EncodedMedia {
    pub fn frame_count(&self) -> usize {
        self.clips.iter().map(|c| c.data_urls.len()).sum()
    }
}

/// The windows of `sample` sent to the labeler, in request order.
pub fn request_windows(sample: &ClipSample, include_future: bool) -> Vec<(WindowKind, &Window)> {
    let mut windows = vec![
        (WindowKind::NearPast, &sample.history.near_past),
        (WindowKind::LongPast, &sample.history.long_past),
    ];
    if include_future {
        windows.push((WindowKind::NearFuture, &sample.lookahead.near_future));
        windows.push((WindowKind::LongFuture, &sample.lookahead.long_future));
    }
    windows
}

/// Read and encode the request windows of one sample.
///
/// A frame file that cannot be read skips the sample with
/// `media-unreadable`.
pub async fn encode_sample(
    sample: &ClipSample,
    mime_type: &str,
    include_future: bool,
) -> Outcome<EncodedMedia> {
    let mut hasher = Sha256::new();
    let mut clips = Vec::new();

    for (kind, window) in request_windows(sample, include_future) {
        let mut data_urls = Vec::with_capacity(window.frames.len());
        for rel in &window.frames {
            let path = sample.frames_root.join(rel);
            let bytes = tokio::fs::read(&path).await.map_err(|e| {
                Skip::new(
                    SkipReason::MediaUnreadable,
                    format!("{}: {e}", path.display()),
                )
            })?;
            // Length-prefixed so frame boundaries are part of the digest.
            hasher.update((bytes.len() as u64).to_le_bytes());
            hasher.update(&bytes);
            data_urls.push(format!("data:{mime_type};base64,{}", STANDARD.encode(&bytes)));
        }
        clips.push(EncodedClip { kind, data_urls });
    }

    let digest = hasher.finalize();
    Ok(EncodedMedia {
        clips,
        fingerprint: hex_prefix(&digest, digest.len()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clip::{HistoryWindows, LookaheadWindows};
    use tempfile::tempdir;

    fn sample_over(root: &std::path::Path, names: &[&str]) -> ClipSample {
        let window = Window {
            indices: (0..names.len()).collect(),
            frames: names.iter().map(|n| n.to_string()).collect(),
        };
        ClipSample {
            sample_id: "ep_t000000".into(),
            episode_id: "ep".into(),
            anchor: 0,
            frames_root: root.to_path_buf(),
            history: HistoryWindows {
                near_past: window.clone(),
                long_past: window.clone(),
            },
            lookahead: LookaheadWindows {
                near_future: window.clone(),
                long_future: window,
            },
            action: "noop".into(),
            goal: None,
            instruct: None,
            task_id: None,
            step_id: None,
            step_text: None,
        }
    }

    #[tokio::test]
    async fn test_encode_and_fingerprint() {
        let tmp = tempdir().unwrap();
        std::fs::write(tmp.path().join("a.jpg"), b"AAA").unwrap();
        std::fs::write(tmp.path().join("b.jpg"), b"BBB").unwrap();
        let sample = sample_over(tmp.path(), &["a.jpg", "b.jpg"]);

        let with_future = encode_sample(&sample, "image/jpeg", true).await.unwrap();
        assert_eq!(with_future.clips.len(), 4);
        assert_eq!(with_future.frame_count(), 8);
        assert_eq!(with_future.clips[0].data_urls[0], "data:image/jpeg;base64,QUFB");

        let history_only = encode_sample(&sample, "image/jpeg", false).await.unwrap();
        assert_eq!(history_only.clips.len(), 2);
        assert_ne!(with_future.fingerprint, history_only.fingerprint);

        let again = encode_sample(&sample, "image/jpeg", true).await.unwrap();
        assert_eq!(again.fingerprint, with_future.fingerprint);
    }

    #[tokio::test]
    async fn test_fingerprint_separates_frame_boundaries() {
        let tmp = tempdir().unwrap();
        std::fs::write(tmp.path().join("a.jpg"), b"AB").unwrap();
        std::fs::write(tmp.path().join("b.jpg"), b"C").unwrap();
        std::fs::write(tmp.path().join("c.jpg"), b"A").unwrap();
        std::fs::write(tmp.path().join("d.jpg"), b"BC").unwrap();

        let split_late = encode_sample(&sample_over(tmp.path(), &["a.jpg", "b.jpg"]), "image/jpeg", false)
            .await
            .unwrap();
        let split_early = encode_sample(&sample_over(tmp.path(), &["c.jpg", "d.jpg"]), "image/jpeg", false)
            .await
            .unwrap();
        assert_ne!(split_late.fingerprint, split_early.fingerprint);
    }

    #[tokio::test]
    async fn test_fingerprint_follows_content() {
        let tmp = tempdir().unwrap();
        std::fs::write(tmp.path().join("a.jpg"), b"AAA").unwrap();
        let sample = sample_over(tmp.path(), &["a.jpg"]);
        let before = encode_sample(&sample, "image/jpeg", false).await.unwrap();
        std::fs::write(tmp.path().join("a.jpg"), b"CCC").unwrap();
        let after = encode_sample(&sample, "image/jpeg", false).await.unwrap();
        assert_ne!(before.fingerprint, after.fingerprint);
    }

    #[tokio::test]
    async fn test_unreadable_frame() {
        let tmp = tempdir().unwrap();
        let sample = sample_over(tmp.path(), &["missing.jpg"]);
        let skip = encode_sample(&sample, "image/jpeg", false).await.unwrap_err();
        assert_eq!(skip.reason, SkipReason::MediaUnreadable);
    }
}
