//! Prompt templates for the labeling round.
//!
//! A labeling conversation is one system message plus one multimodal user
//! message: a text block describing the sample and the expected fields, then
//! every window as a header followed by its frames.

use crate::clip::ClipSample;
use crate::label::media::EncodedMedia;
use crate::model::api::{ChatMessage, ContentPart};
use crate::vocab::Vocabulary;

/// The built-in system prompt.
pub fn default_system_prompt() -> String {
    [
        "You are a game automation data labeling assistant.",
        "Return JSON only; do not include explanations.",
        "short_goal_dsl must be executable within 1-10 seconds.",
        "goal may be wrong or empty; correct it using visual evidence.",
        "lookahead clips are only for judging next_mid_step, horizon_steps, and done_evidence.",
        "Do not use lookahead clips to invent short_goal_dsl.",
        "Output fields: goal, next_mid_step, short_goal_dsl, horizon_steps,",
        "done_evidence, fallback_if_failed, uncertainty, attempt.",
        "Optional fields: mid_step_id, need_replan (true when the current plan must be abandoned).",
        "uncertainty must be one of: low, mid, high.",
    ]
    .join("\n")
}

// ---------------------------------------------------------------------------
// User text
// ---------------------------------------------------------------------------

/// The text block describing one sample.
pub fn labeling_user_text(
    sample: &ClipSample,
    media: &EncodedMedia,
    vocab: &Vocabulary,
    include_enums: bool,
) -> String {
    let mut lines = vec![
        "Input fields:".to_string(),
        format!("sample_id: {}", sample.sample_id),
        format!("goal: {}", sample.goal.as_deref().unwrap_or("")),
        format!("labeling_instruct: {}", sample.instruct.as_deref().unwrap_or("")),
    ];
    if let Some(step) = &sample.step_text {
        lines.push(format!("mid_step: {step}"));
    }
    for clip in &media.clips {
        lines.push(format!(
            "{}: {} frames attached",
            clip.kind.name(),
            clip.data_urls.len()
        ));
    }
    lines.extend(
        [
            "Field definitions:",
            "goal: <|goal_start|>long_goal/mid_goal<|goal_end|> format.",
            "next_mid_step: if current step is complete, output the next step; otherwise keep current.",
            "short_goal_dsl: list of DSL ops with args; ops must come from dsl_ops_enum.",
            "horizon_steps: number of frames at 2FPS (1 step = 0.5s).",
            "done_evidence: list from done_evidence_enum.",
            "fallback_if_failed: list from fallback_actions_enum.",
            "uncertainty: low/mid/high.",
            "attempt: summary of past, current reasoning, and next plan.",
        ]
        .map(String::from),
    );

    if include_enums {
        lines.push("Enums:".into());
        lines.push(format!("dsl_ops_enum: {}", json_list(&vocab.ops)));
        lines.push(format!("done_evidence_enum: {}", json_list(&vocab.done_evidence)));
        lines.push(format!(
            "fallback_actions_enum: {}",
            json_list(&vocab.fallback_actions)
        ));
        if !vocab.tasks.is_empty() {
            lines.push(format!("mid_step_id_enum: {}", json_list(&vocab.tasks)));
        }
    } else {
        lines.push("Enums: omitted".into());
    }

    lines.join("\n")
}

fn json_list<T: serde::Serialize>(items: &[T]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
}

// ---------------------------------------------------------------------------
// Full conversation
// ---------------------------------------------------------------------------

/// Build the labeling conversation for one encoded sample.
pub fn labeling_messages(
    system_prompt: Option<&str>,
    sample: &ClipSample,
    media: &EncodedMedia,
    vocab: &Vocabulary,
    include_enums: bool,
) -> Vec<ChatMessage> {
    let system = system_prompt
        .map(str::to_string)
        .unwrap_or_else(default_system_prompt);

    let mut parts = vec![ContentPart::text(labeling_user_text(
        sample,
        media,
        vocab,
        include_enums,
    ))];
    for clip in &media.clips {
        let label = clip.kind.name();
        parts.push(ContentPart::text(format!(
            "{label} ({} frames):",
            clip.data_urls.len()
        )));
        for (i, url) in clip.data_urls.iter().enumerate() {
            parts.push(ContentPart::text(format!("{label} frame {}", i + 1)));
            parts.push(ContentPart::image(url.clone()));
        }
    }

    vec![ChatMessage::system(system), ChatMessage::user_parts(parts)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clip::{HistoryWindows, LookaheadWindows, WindowKind};
    use crate::label::media::EncodedClip;
    use crate::model::api::MessageContent;
    use crate::vocab::fixtures::test_vocab;

    fn sample() -> ClipSample {
        ClipSample {
            sample_id: "ep_t000130".into(),
            episode_id: "ep".into(),
            anchor: 130,
            frames_root: "frames".into(),
            history: HistoryWindows::default(),
            lookahead: LookaheadWindows::default(),
            action: "W".into(),
            goal: Some("reach the gate".into()),
            instruct: None,
            task_id: None,
            step_id: Some("gate".into()),
            step_text: Some("walk to the gate".into()),
        }
    }

    fn media() -> EncodedMedia {
        EncodedMedia {
            clips: vec![
                EncodedClip {
                    kind: WindowKind::NearPast,
                    data_urls: vec!["data:a".into(), "data:b".into()],
                },
                EncodedClip {
                    kind: WindowKind::NearFuture,
                    data_urls: vec!["data:c".into()],
                },
            ],
            fingerprint: "f".into(),
        }
    }

    #[test]
    fn test_user_text_lists_windows_and_enums() {
        let vocab = test_vocab();
        let text = labeling_user_text(&sample(), &media(), &vocab, true);
        assert!(text.contains("sample_id: ep_t000130"));
        assert!(text.contains("goal: reach the gate"));
        assert!(text.contains("recent_clip: 2 frames attached"));
        assert!(text.contains("lookahead_clip: 1 frames attached"));
        assert!(text.contains("\"enemy_dead\""));

        let without = labeling_user_text(&sample(), &media(), &vocab, false);
        assert!(without.contains("Enums: omitted"));
        assert!(!without.contains("enemy_dead"));
    }

    #[test]
    fn test_messages_interleave_frames() {
        let vocab = test_vocab();
        let msgs = labeling_messages(None, &sample(), &media(), &vocab, true);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, "system");
        let MessageContent::Parts(parts) = &msgs[1].content else {
            panic!("expected multimodal user message");
        };
        let images = parts
            .iter()
            .filter(|p| matches!(p, ContentPart::ImageUrl { .. }))
            .count();
        assert_eq!(images, 3);
    }

    #[test]
    fn test_system_prompt_override() {
        let vocab = test_vocab();
        let msgs = labeling_messages(Some("custom"), &sample(), &media(), &vocab, true);
        assert_eq!(msgs[0].content, MessageContent::Text("custom".into()));
    }
}
