// Manifest engine: fetches M3U8 text and lowers the parsed playlist into the
// dense, fully-resolved segment list the worker pool consumes.

use crate::client::{self, TextResponse};
use crate::error::EngineError;
use async_trait::async_trait;
use m3u8_rs::{parse_playlist_res, KeyMethod, MediaPlaylist, Playlist};
use reqwest::header::HeaderMap;
use reqwest::Client;
use tracing::debug;
use url::Url;

/// IV directive for an encrypted segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentIv {
    /// Explicit `IV=0x…` attribute from the playlist.
    Explicit([u8; 16]),
    /// Implicit IV: big-endian media sequence number of the segment.
    Sequence(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentEncryption {
    /// Absolute key URI, resolved against the playlist URL.
    pub key_uri: String,
    pub iv: SegmentIv,
}

/// One playlist entry. Immutable once parsed; indices are dense `[0, N)`.
#[derive(Debug, Clone)]
pub struct SegmentDescriptor {
    pub index: usize,
    pub url: Url,
    pub duration: f32,
    pub encryption: Option<SegmentEncryption>,
}

#[derive(Debug, Clone)]
pub struct MediaManifest {
    pub media_sequence: u64,
    pub segments: Vec<SegmentDescriptor>,
}

#[async_trait]
pub trait PlaylistSource: Send + Sync {
    async fn load(&self, url: &str) -> Result<MediaManifest, EngineError>;
}

pub struct HttpPlaylistSource {
    client: Client,
    headers: HeaderMap,
}

impl HttpPlaylistSource {
    pub fn new(client: Client, headers: HeaderMap) -> Self {
        Self { client, headers }
    }
}

#[async_trait]
impl PlaylistSource for HttpPlaylistSource {
    async fn load(&self, url: &str) -> Result<MediaManifest, EngineError> {
        let playlist_url = Url::parse(url).map_err(|e| {
            EngineError::malformed_playlist(format!("invalid playlist URL `{url}`: {e}"))
        })?;

        let TextResponse { body, content_type } =
            client::get_text(&self.client, playlist_url.as_str(), &self.headers).await?;

        if let Some(ct) = content_type.as_deref() {
            if !is_playlist_content_type(ct) {
                return Err(EngineError::malformed_playlist(format!(
                    "content type `{ct}` does not look like an M3U8 playlist"
                )));
            }
        }

        let manifest = parse_media_manifest(&body, &playlist_url)?;
        debug!(
            url,
            segments = manifest.segments.len(),
            media_sequence = manifest.media_sequence,
            "Parsed media playlist"
        );
        Ok(manifest)
    }
}

/// Accept the content types real origin servers use for playlists. A stricter
/// check would reject the widespread `application/octet-stream` fallback.
fn is_playlist_content_type(content_type: &str) -> bool {
    let ct = content_type.to_ascii_lowercase();
    ct.contains("mpegurl")
        || ct.contains("m3u8")
        || ct.contains("text")
        || ct.contains("plain")
        || ct.contains("application/octet-stream")
}

/// Lower raw playlist text into a [`MediaManifest`].
///
/// Master playlists and live (endless) playlists are rejected: variant
/// selection belongs to the caller, and sliding windows are out of scope.
pub fn parse_media_manifest(text: &str, playlist_url: &Url) -> Result<MediaManifest, EngineError> {
    if !text.trim_start().starts_with("#EXTM3U") {
        return Err(EngineError::malformed_playlist("missing #EXTM3U header"));
    }

    let playlist = parse_playlist_res(text.as_bytes()).map_err(|e| {
        debug!(error = ?e, "M3U8 parse failure");
        EngineError::malformed_playlist("not a valid M3U8 playlist")
    })?;

    let media = match playlist {
        Playlist::MasterPlaylist(_) => return Err(EngineError::MasterPlaylistNotSupported),
        Playlist::MediaPlaylist(media) => media,
    };

    lower_media_playlist(media, playlist_url)
}

fn lower_media_playlist(
    media: MediaPlaylist,
    playlist_url: &Url,
) -> Result<MediaManifest, EngineError> {
    if !media.end_list {
        return Err(EngineError::LivePlaylistNotSupported);
    }
    if media.segments.is_empty() {
        return Err(EngineError::malformed_playlist(
            "playlist contains no segments",
        ));
    }

    let media_sequence = media.media_sequence;
    let mut segments = Vec::with_capacity(media.segments.len());

    for (index, segment) in media.segments.iter().enumerate() {
        let url = playlist_url.join(&segment.uri).map_err(|e| {
            EngineError::malformed_playlist(format!(
                "cannot resolve segment URI `{}`: {e}",
                segment.uri
            ))
        })?;

        let encryption = match &segment.key {
            None => None,
            Some(key) => match &key.method {
                KeyMethod::None => None,
                KeyMethod::AES128 => {
                    let key_uri = key
                        .uri
                        .as_deref()
                        .filter(|uri| !uri.is_empty())
                        .ok_or_else(|| {
                            EngineError::malformed_playlist("AES-128 key without a URI")
                        })?;
                    let key_url = playlist_url.join(key_uri).map_err(|e| {
                        EngineError::malformed_playlist(format!(
                            "cannot resolve key URI `{key_uri}`: {e}"
                        ))
                    })?;
                    let iv = match key.iv.as_deref() {
                        Some(raw) => SegmentIv::Explicit(parse_iv(raw)?),
                        None => SegmentIv::Sequence(media_sequence + index as u64),
                    };
                    Some(SegmentEncryption {
                        key_uri: key_url.to_string(),
                        iv,
                    })
                }
                other => {
                    return Err(EngineError::malformed_playlist(format!(
                        "unsupported encryption method {other:?}"
                    )));
                }
            },
        };

        segments.push(SegmentDescriptor {
            index,
            url,
            duration: segment.duration,
            encryption,
        });
    }

    Ok(MediaManifest {
        media_sequence,
        segments,
    })
}

fn parse_iv(raw: &str) -> Result<[u8; 16], EngineError> {
    let hex_digits = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .unwrap_or(raw);
    let bytes = hex::decode(hex_digits)
        .map_err(|e| EngineError::malformed_playlist(format!("invalid IV `{raw}`: {e}")))?;
    bytes.as_slice().try_into().map_err(|_| {
        EngineError::malformed_playlist(format!("IV `{raw}` is not 16 bytes"))
    })
}
