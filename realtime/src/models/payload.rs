//! Typed payloads encoded inside a message's `content`.
//!
//! Plain text is stored verbatim. Media uses a prefix followed by fields
//! separated with `|`:
//!
//! - `[GIF]<url>`
//! - `[IMAGE]<dataUrl>|<fileName>|<fileSizeBytes>`
//! - `[VIDEO]<dataUrl>|<fileName>|<fileSizeBytes>`

const GIF_PREFIX: &str = "[GIF]";
const IMAGE_PREFIX: &str = "[IMAGE]";
const VIDEO_PREFIX: &str = "[VIDEO]";

const PREVIEW_MAX_CHARS: usize = 80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPayload {
    pub data_url: String,
    pub file_name: String,
    pub file_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagePayload {
    Text(String),
    Gif { url: String },
    Image(MediaPayload),
    Video(MediaPayload),
}

impl MessagePayload {
    /// Decode message content. Malformed media encodings are treated as text.
    pub fn parse(content: &str) -> Self {
        if let Some(url) = content.strip_prefix(GIF_PREFIX) {
            if !url.is_empty() {
                return MessagePayload::Gif {
                    url: url.to_string(),
                };
            }
        } else if let Some(rest) = content.strip_prefix(IMAGE_PREFIX) {
            if let Some(media) = parse_media(rest) {
                return MessagePayload::Image(media);
            }
        } else if let Some(rest) = content.strip_prefix(VIDEO_PREFIX) {
            if let Some(media) = parse_media(rest) {
                return MessagePayload::Video(media);
            }
        }
        MessagePayload::Text(content.to_string())
    }

    pub fn encode(&self) -> String {
        match self {
            MessagePayload::Text(text) => text.clone(),
            MessagePayload::Gif { url } => format!("{}{}", GIF_PREFIX, url),
            MessagePayload::Image(media) => format!("{}{}", IMAGE_PREFIX, encode_media(media)),
            MessagePayload::Video(media) => format!("{}{}", VIDEO_PREFIX, encode_media(media)),
        }
    }

    pub fn is_media(&self) -> bool {
        !matches!(self, MessagePayload::Text(_))
    }

    /// Short text suitable for a toast or conversation list row.
    pub fn preview(&self) -> String {
        match self {
            MessagePayload::Text(text) => truncate(text.trim(), PREVIEW_MAX_CHARS),
            MessagePayload::Gif { .. } => "Sent a GIF".to_string(),
            MessagePayload::Image(media) => format!("Sent an image: {}", media.file_name),
            MessagePayload::Video(media) => format!("Sent a video: {}", media.file_name),
        }
    }
}

// The data URL itself contains commas and may contain `|`, so split from the right.
fn parse_media(rest: &str) -> Option<MediaPayload> {
    let mut parts = rest.rsplitn(3, '|');
    let size = parts.next()?;
    let file_name = parts.next()?;
    let data_url = parts.next()?;
    if data_url.is_empty() || file_name.is_empty() {
        return None;
    }
    Some(MediaPayload {
        data_url: data_url.to_string(),
        file_name: file_name.to_string(),
        file_size: size.trim().parse().ok()?,
    })
}

fn encode_media(media: &MediaPayload) -> String {
    format!("{}|{}|{}", media.data_url, media.file_name, media.file_size)
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}
