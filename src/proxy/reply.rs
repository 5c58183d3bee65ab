//! Reply payload normalization
//!
//! Upstream reply producers hand the gateway several payload shapes: a
//! bare string, a single structured segment, an array of segments, or a
//! wrapper object `{segments, title, description}`. Everything funnels
//! through `normalize_reply` into one segment array before it touches
//! the wire.
//!
//! Segments that reference local files are rewritten into servable URLs
//! here, distinguishing the quarantine (trash) storage area from general
//! absolute paths. A `forward` segment (a bundled transcript) is kept
//! intact and flagged so the proxy can emit it as its own frame type.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::MediaSettings;

/// One structured message segment on the wire: `{"type": ..., "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Segment {
    Text {
        text: String,
    },
    Image {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    Record {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    Video {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    /// Bundled transcript of other messages.
    Forward {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(default)]
        content: Vec<Value>,
    },
}

/// Wrapper payload shape: `{segments, title?, description?}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplyWrapper {
    #[serde(default)]
    pub segments: Vec<Segment>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Any payload shape the reply adapter accepts.
///
/// Variant order matters: a map with a `type` key is a segment, any
/// other map falls through to the wrapper.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ReplyPayload {
    Text(String),
    One(Segment),
    Many(Vec<Segment>),
    Wrapper(ReplyWrapper),
}

impl From<&str> for ReplyPayload {
    fn from(text: &str) -> Self {
        ReplyPayload::Text(text.to_string())
    }
}

impl From<String> for ReplyPayload {
    fn from(text: String) -> Self {
        ReplyPayload::Text(text)
    }
}

/// Normalized form every payload reduces to.
#[derive(Debug, Clone)]
pub struct NormalizedReply {
    pub segments: Vec<Segment>,
    pub title: Option<String>,
    pub description: Option<String>,
}

impl NormalizedReply {
    /// A reply consisting of exactly one forward segment is transmitted
    /// as a `forward` frame instead of a `reply` frame.
    pub fn as_forward(&self) -> Option<(Option<String>, Option<String>, Vec<Value>)> {
        match self.segments.as_slice() {
            [
                Segment::Forward {
                    title,
                    description,
                    content,
                },
            ] => Some((
                self.title.clone().or_else(|| title.clone()),
                self.description.clone().or_else(|| description.clone()),
                content.clone(),
            )),
            _ => None,
        }
    }
}

/// Reduce any accepted payload shape to a segment array and rewrite
/// local file references into servable URLs.
pub fn normalize_reply(payload: ReplyPayload, media: &MediaSettings) -> NormalizedReply {
    let (segments, title, description) = match payload {
        ReplyPayload::Text(text) => {
            if text.trim().is_empty() {
                (Vec::new(), None, None)
            } else {
                (vec![Segment::Text { text }], None, None)
            }
        }
        ReplyPayload::One(segment) => (vec![segment], None, None),
        ReplyPayload::Many(segments) => (segments, None, None),
        ReplyPayload::Wrapper(wrapper) => (wrapper.segments, wrapper.title, wrapper.description),
    };

    let segments = segments
        .into_iter()
        .map(|segment| rewrite_segment(segment, media))
        .collect();

    NormalizedReply {
        segments,
        title,
        description,
    }
}

/// Plain-text rendering of a segment array (text segments joined).
pub fn flatten_text(segments: &[Segment]) -> String {
    segments
        .iter()
        .filter_map(|segment| match segment {
            Segment::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("")
}

fn rewrite_segment(segment: Segment, media: &MediaSettings) -> Segment {
    match segment {
        Segment::Image { file, url } => {
            let (file, url) = rewrite_file_ref(file, url, media);
            Segment::Image { file, url }
        }
        Segment::Record { file, url } => {
            let (file, url) = rewrite_file_ref(file, url, media);
            Segment::Record { file, url }
        }
        Segment::Video { file, url } => {
            let (file, url) = rewrite_file_ref(file, url, media);
            Segment::Video { file, url }
        }
        other => other,
    }
}

/// Rewrite a `file` reference into a servable URL.
///
/// - `http(s)://` and `data:` references move to `url` untouched.
/// - `file://` prefixes are stripped before path handling.
/// - Paths under the trash dir map to `/files/trash/{name}`.
/// - Other absolute paths map to `/files/{name}`.
/// - Relative paths stay on `file` (already server-relative).
fn rewrite_file_ref(
    file: Option<String>,
    url: Option<String>,
    media: &MediaSettings,
) -> (Option<String>, Option<String>) {
    let Some(reference) = file else {
        return (None, url);
    };

    if reference.starts_with("http://")
        || reference.starts_with("https://")
        || reference.starts_with("data:")
    {
        return (None, Some(reference));
    }

    let path = reference.strip_prefix("file://").unwrap_or(&reference);
    if !path.starts_with('/') {
        return (Some(reference), url);
    }

    let trash = media.trash_dir.to_string_lossy();
    let name = path.rsplit('/').next().unwrap_or(path);
    let mount = if in_dir(path, &trash) {
        format!("/files/trash/{name}")
    } else {
        format!("/files/{name}")
    };
    (None, Some(format!("{}{}", media.public_base_url, mount)))
}

fn in_dir(path: &str, dir: &str) -> bool {
    let dir = dir.trim_end_matches('/');
    !dir.is_empty() && path.starts_with(dir) && path[dir.len()..].starts_with('/')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    fn media() -> MediaSettings {
        MediaSettings {
            public_base_url: "http://gw.local:8790".to_string(),
            files_dir: PathBuf::from("/srv/media"),
            trash_dir: PathBuf::from("/srv/media/trash"),
        }
    }

    #[test]
    fn test_all_shapes_normalize_identically() {
        let expected = vec![Segment::Text {
            text: "hello".to_string(),
        }];

        let from_text = normalize_reply("hello".into(), &media());
        let from_one = normalize_reply(
            ReplyPayload::One(Segment::Text {
                text: "hello".to_string(),
            }),
            &media(),
        );
        let from_many = normalize_reply(
            ReplyPayload::Many(vec![Segment::Text {
                text: "hello".to_string(),
            }]),
            &media(),
        );
        let from_wrapper: ReplyPayload =
            serde_json::from_value(json!({"segments": [{"type": "text", "data": {"text": "hello"}}]}))
                .unwrap();
        let from_wrapper = normalize_reply(from_wrapper, &media());

        assert_eq!(from_text.segments, expected);
        assert_eq!(from_one.segments, expected);
        assert_eq!(from_many.segments, expected);
        assert_eq!(from_wrapper.segments, expected);
    }

    #[test]
    fn test_blank_text_yields_zero_segments() {
        let normalized = normalize_reply("   ".into(), &media());
        assert!(normalized.segments.is_empty());
    }

    #[test]
    fn test_trash_path_maps_to_trash_mount() {
        let normalized = normalize_reply(
            ReplyPayload::One(Segment::Image {
                file: Some("/srv/media/trash/cap_01.jpg".to_string()),
                url: None,
            }),
            &media(),
        );
        assert_eq!(
            normalized.segments,
            vec![Segment::Image {
                file: None,
                url: Some("http://gw.local:8790/files/trash/cap_01.jpg".to_string()),
            }]
        );
    }

    #[test]
    fn test_absolute_path_maps_to_files_mount() {
        let normalized = normalize_reply(
            ReplyPayload::One(Segment::Record {
                file: Some("file:///var/tmp/utterance.wav".to_string()),
                url: None,
            }),
            &media(),
        );
        assert_eq!(
            normalized.segments,
            vec![Segment::Record {
                file: None,
                url: Some("http://gw.local:8790/files/utterance.wav".to_string()),
            }]
        );
    }

    #[test]
    fn test_existing_url_moves_to_url_field() {
        let normalized = normalize_reply(
            ReplyPayload::One(Segment::Image {
                file: Some("https://cdn.example.com/a.png".to_string()),
                url: None,
            }),
            &media(),
        );
        assert_eq!(
            normalized.segments,
            vec![Segment::Image {
                file: None,
                url: Some("https://cdn.example.com/a.png".to_string()),
            }]
        );
    }

    #[test]
    fn test_relative_path_left_untouched() {
        let normalized = normalize_reply(
            ReplyPayload::One(Segment::Video {
                file: Some("clips/intro.mp4".to_string()),
                url: None,
            }),
            &media(),
        );
        assert_eq!(
            normalized.segments,
            vec![Segment::Video {
                file: Some("clips/intro.mp4".to_string()),
                url: None,
            }]
        );
    }

    #[test]
    fn test_forward_segment_detected() {
        let payload: ReplyPayload = serde_json::from_value(json!({
            "type": "forward",
            "data": {
                "title": "conversation",
                "content": [{"text": "first"}, {"text": "second"}]
            }
        }))
        .unwrap();
        let normalized = normalize_reply(payload, &media());
        let (title, _, content) = normalized.as_forward().expect("forward reply");
        assert_eq!(title.as_deref(), Some("conversation"));
        assert_eq!(content.len(), 2);
    }

    #[test]
    fn test_flatten_text_joins_text_segments() {
        let segments = vec![
            Segment::Text {
                text: "a".to_string(),
            },
            Segment::Image {
                file: None,
                url: Some("http://x/y.png".to_string()),
            },
            Segment::Text {
                text: "b".to_string(),
            },
        ];
        assert_eq!(flatten_text(&segments), "ab");
    }
}
