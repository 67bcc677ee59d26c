use crate::config::{SpotifyConfig, YoutubeConfig};
use crate::error::{AppError, AppResult};
use crate::music::request::{MediaRequest, SearchType};
use rand::seq::SliceRandom;
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

pub const YOUTUBE_VIDEO_PREFIX: &str = "https://www.youtube.com/watch?v=";

static SPOTIFY_PLAYLIST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https://open\.spotify\.com/playlist/(?P<id>[a-zA-Z0-9]+)").unwrap()
});
static SPOTIFY_ALBUM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https://open\.spotify\.com/album/(?P<id>[a-zA-Z0-9]+)").unwrap()
});
static SPOTIFY_TRACK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https://open\.spotify\.com/track/(?P<id>[a-zA-Z0-9]+)").unwrap()
});
static YOUTUBE_PLAYLIST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https://(www\.)?youtube\.com/playlist\?list=(?P<id>[a-zA-Z0-9_-]+)").unwrap()
});
static YOUTUBE_VIDEO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https://(www\.)?youtu(\.be/|be\.com/watch\?v=)(?P<id>[a-zA-Z0-9_-]{11})")
        .unwrap()
});
static YOUTUBE_SHORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https://(www\.)?youtube\.com/shorts/(?P<id>[a-zA-Z0-9_-]{11})").unwrap()
});

/// How one raw input classifies, applied in order
#[derive(Debug, Clone, PartialEq, Eq)]
enum Classified {
    SpotifyPlaylist(String),
    SpotifyAlbum(String),
    SpotifyTrack(String),
    YoutubePlaylist(String),
    YoutubeVideo(String),
    Direct(String),
    FreeText(String),
}

fn classify(core: &str) -> Classified {
    if let Some(m) = SPOTIFY_PLAYLIST_RE.captures(core) {
        return Classified::SpotifyPlaylist(m["id"].to_string());
    }
    if let Some(m) = SPOTIFY_ALBUM_RE.captures(core) {
        return Classified::SpotifyAlbum(m["id"].to_string());
    }
    if let Some(m) = SPOTIFY_TRACK_RE.captures(core) {
        return Classified::SpotifyTrack(m["id"].to_string());
    }
    if let Some(m) = YOUTUBE_PLAYLIST_RE.captures(core) {
        return Classified::YoutubePlaylist(m["id"].to_string());
    }
    if let Some(m) = YOUTUBE_SHORT_RE.captures(core) {
        return Classified::YoutubeVideo(m["id"].to_string());
    }
    if let Some(m) = YOUTUBE_VIDEO_RE.captures(core) {
        return Classified::YoutubeVideo(m["id"].to_string());
    }
    if core.starts_with("https://") {
        return Classified::Direct(core.to_string());
    }
    Classified::FreeText(core.to_string())
}

/// Trailing modifier tokens after a URL: `shuffle` permutes the expansion,
/// a number truncates it. They may appear in either order.
fn parse_modifiers(input: &str) -> (String, bool, Option<usize>) {
    let mut tokens: Vec<&str> = input.split_whitespace().collect();
    let mut shuffle = false;
    let mut limit = None;
    while let Some(last) = tokens.last() {
        if tokens.len() == 1 {
            break;
        }
        if last.eq_ignore_ascii_case("shuffle") {
            shuffle = true;
            tokens.pop();
            continue;
        }
        if let Ok(n) = last.parse::<usize>() {
            limit = Some(n);
            tokens.pop();
            continue;
        }
        break;
    }
    (tokens.join(" "), shuffle, limit)
}

/// Who asked, used to stamp the produced requests
#[derive(Debug, Clone)]
pub struct Requester {
    pub guild_id: u64,
    pub channel_id: u64,
    pub name: String,
    pub id: u64,
}

/// Result of resolving one play command
#[derive(Debug)]
pub struct ResolvedSearch {
    pub requests: Vec<MediaRequest>,
    /// Better display name from the catalog (album or playlist title)
    pub display_name: Option<String>,
}

/// Classifies input strings and expands catalog URLs into media requests.
///
/// Missing catalog clients deterministically disable the matching URL class
/// with a user-facing error rather than guessing.
pub struct SearchResolver {
    spotify: Option<SpotifyClient>,
    youtube: Option<YoutubeClient>,
}

impl SearchResolver {
    pub fn new(spotify: Option<SpotifyClient>, youtube: Option<YoutubeClient>) -> Self {
        Self { spotify, youtube }
    }

    pub fn youtube(&self) -> Option<&YoutubeClient> {
        self.youtube.as_ref()
    }

    /// Produce the media requests for one play command. Zero requests is a
    /// valid outcome only for empty playlists; catalog failures are errors.
    pub async fn resolve(&self, input: &str, requester: &Requester) -> AppResult<ResolvedSearch> {
        let (core, shuffle, limit) = parse_modifiers(input);

        let (mut items, display_name) = match classify(&core) {
            Classified::SpotifyPlaylist(id) => {
                let spotify = self.spotify.as_ref().ok_or_else(|| {
                    AppError::catalog("Spotify URLs invalid, no spotify credentials available")
                })?;
                let (tracks, name) = spotify.playlist_tracks(&id).await?;
                (
                    tracks
                        .into_iter()
                        .map(|t| (t, SearchType::StreamingTrack))
                        .collect::<Vec<_>>(),
                    name,
                )
            }
            Classified::SpotifyAlbum(id) => {
                let spotify = self.spotify.as_ref().ok_or_else(|| {
                    AppError::catalog("Spotify URLs invalid, no spotify credentials available")
                })?;
                let (tracks, name) = spotify.album_tracks(&id).await?;
                (
                    tracks
                        .into_iter()
                        .map(|t| (t, SearchType::StreamingTrack))
                        .collect::<Vec<_>>(),
                    name,
                )
            }
            Classified::SpotifyTrack(id) => {
                let spotify = self.spotify.as_ref().ok_or_else(|| {
                    AppError::catalog("Spotify URLs invalid, no spotify credentials available")
                })?;
                let track = spotify.track(&id).await?;
                (vec![(track, SearchType::StreamingTrack)], None)
            }
            Classified::YoutubePlaylist(id) => {
                let youtube = self.youtube.as_ref().ok_or_else(|| {
                    AppError::catalog("Playlist URLs invalid, no youtube api credentials available")
                })?;
                let videos = youtube.playlist_items(&id).await?;
                (
                    videos
                        .into_iter()
                        .map(|url| (url, SearchType::VideoPlaylistMember))
                        .collect(),
                    None,
                )
            }
            Classified::YoutubeVideo(id) => (
                vec![(
                    format!("{YOUTUBE_VIDEO_PREFIX}{id}"),
                    SearchType::VideoUrl,
                )],
                None,
            ),
            Classified::Direct(url) => (vec![(url, SearchType::DirectUrl)], None),
            Classified::FreeText(text) => (vec![(text, SearchType::FreeText)], None),
        };

        if shuffle {
            items.shuffle(&mut rand::thread_rng());
        }
        if let Some(limit) = limit {
            items.truncate(limit);
        }

        let requests = items
            .into_iter()
            .map(|(search, search_type)| {
                MediaRequest::new(
                    requester.guild_id,
                    requester.channel_id,
                    requester.name.clone(),
                    requester.id,
                    search,
                    search_type,
                )
            })
            .collect();
        Ok(ResolvedSearch {
            requests,
            display_name,
        })
    }
}

const SPOTIFY_AUTH_URL: &str = "https://accounts.spotify.com/api/token";
const SPOTIFY_BASE_URL: &str = "https://api.spotify.com/v1";

/// Minimal Spotify Web API client using the client-credentials flow
pub struct SpotifyClient {
    client: reqwest::Client,
    client_id: String,
    client_secret: String,
    token: Mutex<Option<(String, Instant)>>,
}

impl SpotifyClient {
    pub fn new(config: &SpotifyConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            token: Mutex::new(None),
        }
    }

    async fn token(&self) -> AppResult<String> {
        let mut guard = self.token.lock().await;
        if let Some((token, expiry)) = guard.as_ref() {
            if Instant::now() < *expiry {
                return Ok(token.clone());
            }
        }
        let response: Value = self
            .client
            .post(SPOTIFY_AUTH_URL)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", &self.client_id),
                ("client_secret", &self.client_secret),
            ])
            .send()
            .await?
            .error_for_status()
            .map_err(|e| AppError::catalog(format!("Spotify auth failed: {e}")))?
            .json()
            .await?;
        let token = response["access_token"]
            .as_str()
            .ok_or_else(|| AppError::catalog("Spotify auth response missing token"))?
            .to_string();
        let expires_in = response["expires_in"].as_u64().unwrap_or(3600);
        let expiry = Instant::now() + Duration::from_secs(expires_in.saturating_sub(60));
        *guard = Some((token.clone(), expiry));
        Ok(token)
    }

    async fn get_json(&self, url: &str) -> AppResult<Value> {
        let token = self.token().await?;
        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(AppError::catalog(
                "Unable to find url via the Spotify API; official playlists may not be available",
            ));
        }
        Ok(response
            .error_for_status()
            .map_err(|e| AppError::catalog(format!("Spotify request failed: {e}")))?
            .json()
            .await?)
    }

    /// Extract "artist title" search strings from a tracks payload, chasing
    /// page links
    async fn collect_tracks(&self, first_url: String) -> AppResult<Vec<String>> {
        let mut results = Vec::new();
        let mut url = Some(first_url);
        while let Some(page_url) = url.take() {
            let data = self.get_json(&page_url).await?;
            let tracks = if data.get("items").is_some() {
                &data
            } else {
                &data["tracks"]
            };
            if let Some(items) = tracks["items"].as_array() {
                for item in items {
                    let track = if item.get("track").is_some() {
                        &item["track"]
                    } else {
                        item
                    };
                    let Some(name) = track["name"].as_str() else {
                        continue;
                    };
                    let artists = track["artists"]
                        .as_array()
                        .map(|a| {
                            a.iter()
                                .filter_map(|artist| artist["name"].as_str())
                                .collect::<Vec<_>>()
                                .join(" ")
                        })
                        .unwrap_or_default();
                    results.push(format!("{artists} {name}").trim().to_string());
                }
            }
            url = tracks["next"].as_str().map(String::from);
        }
        Ok(results)
    }

    pub async fn playlist_tracks(&self, id: &str) -> AppResult<(Vec<String>, Option<String>)> {
        let data = self
            .get_json(&format!("{SPOTIFY_BASE_URL}/playlists/{id}?fields=name"))
            .await?;
        let name = data["name"].as_str().map(String::from);
        let tracks = self
            .collect_tracks(format!("{SPOTIFY_BASE_URL}/playlists/{id}/tracks"))
            .await?;
        Ok((tracks, name))
    }

    pub async fn album_tracks(&self, id: &str) -> AppResult<(Vec<String>, Option<String>)> {
        let data = self.get_json(&format!("{SPOTIFY_BASE_URL}/albums/{id}")).await?;
        let name = data["name"].as_str().map(String::from);
        let tracks = self
            .collect_tracks(format!("{SPOTIFY_BASE_URL}/albums/{id}/tracks"))
            .await?;
        Ok((tracks, name))
    }

    pub async fn track(&self, id: &str) -> AppResult<String> {
        let data = self.get_json(&format!("{SPOTIFY_BASE_URL}/tracks/{id}")).await?;
        let name = data["name"]
            .as_str()
            .ok_or_else(|| AppError::catalog("Spotify track missing name"))?;
        let artists = data["artists"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|artist| artist["name"].as_str())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default();
        Ok(format!("{artists} {name}").trim().to_string())
    }
}

const YOUTUBE_API_BASE: &str = "https://www.googleapis.com/youtube/v3";

/// YouTube Data API client for playlist expansion and free-text resolution
pub struct YoutubeClient {
    client: reqwest::Client,
    api_key: String,
}

impl YoutubeClient {
    pub fn new(config: &YoutubeConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: config.api_key.clone(),
        }
    }

    /// Canonical video URLs of a playlist, skipping private entries
    pub async fn playlist_items(&self, playlist_id: &str) -> AppResult<Vec<String>> {
        let mut results = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = format!(
                "{YOUTUBE_API_BASE}/playlistItems?key={}&playlistId={playlist_id}&part=snippet,status&maxResults=50",
                self.api_key
            );
            if let Some(token) = &page_token {
                url.push_str(&format!("&pageToken={token}"));
            }
            let data: Value = self
                .client
                .get(&url)
                .send()
                .await?
                .error_for_status()
                .map_err(|e| AppError::catalog(format!("Youtube playlist fetch failed: {e}")))?
                .json()
                .await?;
            if let Some(items) = data["items"].as_array() {
                for item in items {
                    let status = item["status"]["privacyStatus"].as_str().unwrap_or("");
                    if status == "private" || status == "privacyStatusUnspecified" {
                        continue;
                    }
                    let resource = &item["snippet"]["resourceId"];
                    if resource["kind"].as_str() != Some("youtube#video") {
                        continue;
                    }
                    if let Some(video_id) = resource["videoId"].as_str() {
                        results.push(format!("{YOUTUBE_VIDEO_PREFIX}{video_id}"));
                    }
                }
            }
            page_token = data["nextPageToken"].as_str().map(String::from);
            if page_token.is_none() {
                break;
            }
        }
        debug!(count = results.len(), playlist_id, "Expanded youtube playlist");
        Ok(results)
    }

    /// Resolve free text to the best-matching video URL
    pub async fn search_video(&self, query: &str) -> AppResult<Option<String>> {
        let url = format!(
            "{YOUTUBE_API_BASE}/search?key={}&part=snippet&type=video&maxResults=1&q={}",
            self.api_key,
            urlencode(query)
        );
        let data: Value = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| AppError::catalog(format!("Youtube search failed: {e}")))?
            .json()
            .await?;
        let video_id = data["items"]
            .as_array()
            .and_then(|items| items.first())
            .and_then(|item| item["id"]["videoId"].as_str());
        Ok(video_id.map(|id| format!("{YOUTUBE_VIDEO_PREFIX}{id}")))
    }
}

/// Percent-encode a query-string value
fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b' ' => out.push('+'),
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}
