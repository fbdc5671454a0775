// Playlist resolution: turns an M3U8 URL or file into a download request.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use m3u8_rs::{
    AlternativeMediaType, Key, KeyMethod, MasterPlaylist, MediaPlaylist, Playlist,
    parse_playlist_res,
};
use reqwest::Client;
use tracing::{debug, info, warn};
use url::Url;
use vodfetch_engine::{
    CryptoContext, DownloadRequest, DownloaderConfig, FormatContext, SegmentLocator,
};

use crate::error::{AppError, Result};

const KEY_SIZE: usize = 16;

/// One media playlist reduced to what the engine needs.
#[derive(Debug)]
struct TrackPlaylist {
    segments: Vec<SegmentLocator>,
    key: Option<Key>,
    init: Option<SegmentLocator>,
    base: Option<Url>,
}

pub struct PlaylistResolver {
    client: Client,
    /// Base for relative URIs in local playlists.
    base_url: Option<Url>,
    /// Overrides the key named by `#EXT-X-KEY`.
    custom_key: Option<Bytes>,
}

impl PlaylistResolver {
    pub fn new(config: &DownloaderConfig, base_url: Option<Url>) -> Result<Self> {
        Ok(Self {
            client: config.build_client()?,
            base_url,
            custom_key: None,
        })
    }

    pub fn with_custom_key(mut self, key: Bytes) -> Self {
        self.custom_key = Some(key);
        self
    }

    /// Load `input` and resolve it into a request.
    ///
    /// A master playlist resolves to its first variant plus, when that
    /// variant references an audio group, the group's default rendition.
    pub async fn resolve(&self, input: &str) -> Result<DownloadRequest> {
        let (data, base) = self.load(input).await?;

        let (video, audio) = match parse(&data)? {
            Playlist::MediaPlaylist(playlist) => (track_from(&playlist, base)?, None),
            Playlist::MasterPlaylist(master) => self.resolve_master(&master, base.as_ref()).await?,
        };

        if video.segments.is_empty() {
            return Err(AppError::playlist("playlist contains no segments"));
        }

        let crypto = self.crypto_for(&video).await?;
        if let Some(audio) = &audio {
            let audio_crypto = self.crypto_for(audio).await?;
            if audio_crypto.enabled != crypto.enabled
                || audio_crypto.key != crypto.key
                || audio_crypto.iv_hex != crypto.iv_hex
            {
                return Err(AppError::playlist(
                    "audio rendition is encrypted differently from the video",
                ));
            }
        }

        let fragmented = video.init.is_some() || audio.as_ref().is_some_and(|a| a.init.is_some());
        let format = if fragmented {
            let mut format = FormatContext::fragmented(video.init);
            if let Some(init) = audio.as_ref().and_then(|a| a.init.clone()) {
                format = format.with_audio_init(init);
            }
            format
        } else {
            FormatContext::plain()
        };

        info!(
            segments = video.segments.len(),
            audio_segments = audio.as_ref().map_or(0, |a| a.segments.len()),
            encrypted = crypto.enabled,
            fragmented,
            "Playlist resolved"
        );

        let mut request = DownloadRequest::new(video.segments)
            .with_crypto(crypto)
            .with_format(format);
        if let Some(audio) = audio {
            request = request.with_audio(audio.segments);
        }
        Ok(request)
    }

    async fn resolve_master(
        &self,
        master: &MasterPlaylist,
        base: Option<&Url>,
    ) -> Result<(TrackPlaylist, Option<TrackPlaylist>)> {
        let variant = master
            .variants
            .iter()
            .find(|v| !v.is_i_frame)
            .ok_or_else(|| AppError::playlist("master playlist has no variants"))?;
        let variant_uri = resolve_uri(base, &variant.uri)?;
        debug!("Selected first variant: {variant_uri}");
        let video = self.load_media(&variant_uri).await?;

        let rendition = variant.audio.as_deref().and_then(|group| {
            let mut candidates = master.alternatives.iter().filter(|alt| {
                alt.media_type == AlternativeMediaType::Audio
                    && alt.group_id == group
                    && alt.uri.is_some()
            });
            let first = candidates.next()?;
            Some(
                std::iter::once(first)
                    .chain(candidates)
                    .find(|alt| alt.default)
                    .unwrap_or(first),
            )
        });

        let audio = match rendition.and_then(|alt| alt.uri.as_deref()) {
            Some(uri) => {
                let audio_uri = resolve_uri(base, uri)?;
                debug!("Selected audio rendition: {audio_uri}");
                Some(self.load_media(&audio_uri).await?)
            }
            None => None,
        };

        Ok((video, audio))
    }

    async fn load_media(&self, location: &str) -> Result<TrackPlaylist> {
        let (data, base) = self.load(location).await?;
        match parse(&data)? {
            Playlist::MediaPlaylist(playlist) => track_from(&playlist, base),
            Playlist::MasterPlaylist(_) => Err(AppError::playlist(format!(
                "expected a media playlist at {location}, found a master playlist"
            ))),
        }
    }

    /// Read a playlist or key from a URL or the filesystem, returning the
    /// base its relative URIs resolve against.
    async fn load(&self, location: &str) -> Result<(Bytes, Option<Url>)> {
        if is_remote(location) {
            let url = Url::parse(location)?;
            let bytes = self.fetch(&url).await?;
            return Ok((bytes, Some(url)));
        }

        let path = match Url::parse(location) {
            Ok(url) if url.scheme() == "file" => url
                .to_file_path()
                .map_err(|_| AppError::InvalidInput(format!("Invalid file URL: {location}")))?,
            _ => PathBuf::from(location),
        };
        let data = tokio::fs::read(&path)
            .await
            .map_err(|source| AppError::ReadFile {
                path: path.clone(),
                source,
            })?;
        Ok((Bytes::from(data), self.base_url.clone()))
    }

    async fn fetch(&self, url: &Url) -> Result<Bytes> {
        let response = self.client.get(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(AppError::playlist(format!(
                "Failed to fetch {url}: HTTP {}",
                response.status()
            )));
        }
        Ok(response.bytes().await?)
    }

    async fn crypto_for(&self, track: &TrackPlaylist) -> Result<CryptoContext> {
        let Some(key) = &track.key else {
            return Ok(CryptoContext::none());
        };

        match &key.method {
            KeyMethod::None => Ok(CryptoContext::none()),
            KeyMethod::AES128 => {
                let key_bytes = match &self.custom_key {
                    Some(custom) => {
                        info!("Using custom encryption key");
                        custom.clone()
                    }
                    None => {
                        let uri = key
                            .uri
                            .as_deref()
                            .ok_or_else(|| AppError::playlist("AES-128 key tag without a URI"))?;
                        let key_location = resolve_uri(track.base.as_ref(), uri)?;
                        info!("Downloading encryption key from {key_location}");
                        let (bytes, _) = self.load(&key_location).await?;
                        bytes
                    }
                };
                if key_bytes.len() != KEY_SIZE {
                    return Err(AppError::InvalidKey(key_bytes.len()));
                }
                Ok(CryptoContext::aes128(key_bytes, key.iv.clone()))
            }
            other => Err(AppError::playlist(format!(
                "unsupported encryption method: {other:?}"
            ))),
        }
    }
}

fn parse(data: &[u8]) -> Result<Playlist> {
    parse_playlist_res(data).map_err(|e| AppError::playlist(format!("Failed to parse playlist: {e}")))
}

fn is_remote(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

/// Resolve `uri` against `base`. Absolute URLs and absolute paths pass
/// through; a relative URI without a base is an error.
fn resolve_uri(base: Option<&Url>, uri: &str) -> Result<String> {
    if Path::new(uri).is_absolute() {
        return Ok(uri.to_string());
    }
    match Url::parse(uri) {
        Ok(url) => Ok(url.into()),
        Err(url::ParseError::RelativeUrlWithoutBase) => match base {
            Some(base) => Ok(base.join(uri)?.into()),
            None => Err(AppError::playlist(format!(
                "relative URI '{uri}' in a local playlist requires --base-url"
            ))),
        },
        Err(e) => Err(e.into()),
    }
}

fn track_from(playlist: &MediaPlaylist, base: Option<Url>) -> Result<TrackPlaylist> {
    if playlist.segments.iter().any(|s| s.byte_range.is_some()) {
        return Err(AppError::playlist("byte-range segments are not supported"));
    }

    let mut segments = Vec::with_capacity(playlist.segments.len());
    for (index, segment) in playlist.segments.iter().enumerate() {
        segments.push(SegmentLocator::new(
            index,
            resolve_uri(base.as_ref(), &segment.uri)?,
        ));
    }

    let mut keys = playlist.segments.iter().filter_map(|s| s.key.as_ref());
    let key = keys.next().cloned();
    if let Some(first) = &key
        && keys.any(|k| k.method != first.method || k.uri != first.uri || k.iv != first.iv)
    {
        return Err(AppError::playlist("key rotation is not supported"));
    }

    // EXT-X-MAP before the first segment can end up in `unknown_tags`
    // instead of on the segment.
    let map_uri = playlist
        .segments
        .iter()
        .find_map(|s| s.map.as_ref().map(|m| m.uri.clone()))
        .or_else(|| playlist_level_map_uri(playlist));
    let init = match map_uri {
        Some(uri) => Some(SegmentLocator::new(0, resolve_uri(base.as_ref(), &uri)?)),
        None => None,
    };
    if init.is_some() && playlist.segments.iter().filter_map(|s| s.map.as_ref()).count() > 1 {
        warn!("Playlist declares several init segments, using the first");
    }

    Ok(TrackPlaylist {
        segments,
        key,
        init,
        base,
    })
}

fn playlist_level_map_uri(playlist: &MediaPlaylist) -> Option<String> {
    let rest = playlist
        .unknown_tags
        .iter()
        .rev()
        .find(|t| t.tag == "X-MAP")?
        .rest
        .as_deref()?;

    split_attributes(rest).into_iter().find_map(|part| {
        let (key, value) = part.split_once('=')?;
        key.trim().eq_ignore_ascii_case("URI").then(|| {
            let value = value.trim();
            value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value)
                .to_string()
        })
    })
}

/// Split an attribute list on commas outside quoted values.
fn split_attributes(rest: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (idx, ch) in rest.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(rest[start..idx].trim());
                start = idx + 1;
            }
            _ => {}
        }
    }
    if start < rest.len() {
        parts.push(rest[start..].trim());
    }
    parts.retain(|p| !p.is_empty());
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const KEY: &[u8; 16] = b"0123456789abcdef";

    fn resolver(base: Option<&str>) -> PlaylistResolver {
        let base = base.map(|b| Url::parse(b).unwrap());
        PlaylistResolver::new(&DownloaderConfig::default(), base).unwrap()
    }

    async fn serve(server: &MockServer, route: &str, body: &[u8]) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
            .mount(server)
            .await;
    }

    #[test]
    fn resolves_relative_and_absolute_uris() {
        let base = Url::parse("https://cdn.example.com/vod/index.m3u8").unwrap();
        assert_eq!(
            resolve_uri(Some(&base), "seg0.ts").unwrap(),
            "https://cdn.example.com/vod/seg0.ts"
        );
        assert_eq!(
            resolve_uri(Some(&base), "https://other.example.com/a.ts").unwrap(),
            "https://other.example.com/a.ts"
        );
        assert!(matches!(
            resolve_uri(None, "seg0.ts"),
            Err(AppError::Playlist(_))
        ));
    }

    #[test]
    fn splits_quoted_attributes() {
        assert_eq!(
            split_attributes(r#"URI="init,v1.mp4",BYTERANGE="720@0""#),
            vec![r#"URI="init,v1.mp4""#, r#"BYTERANGE="720@0""#]
        );
    }

    #[tokio::test]
    async fn media_playlist_with_key_and_iv() {
        let server = MockServer::start().await;
        let playlist = "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:10\n\
            #EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\",IV=0x00000000000000000000000000000001\n\
            #EXTINF:10.0,\nseg0.ts\n#EXTINF:10.0,\nseg1.ts\n#EXT-X-ENDLIST\n";
        serve(&server, "/vod/index.m3u8", playlist.as_bytes()).await;
        serve(&server, "/vod/key.bin", KEY).await;

        let request = resolver(None)
            .resolve(&format!("{}/vod/index.m3u8", server.uri()))
            .await
            .unwrap();

        assert_eq!(request.video.len(), 2);
        assert_eq!(request.video[1].index, 1);
        assert_eq!(request.video[1].location, format!("{}/vod/seg1.ts", server.uri()));
        assert!(request.crypto.enabled);
        assert_eq!(request.crypto.key.as_ref(), KEY);
        assert_eq!(
            request.crypto.iv_hex.as_deref(),
            Some("0x00000000000000000000000000000001")
        );
        assert!(!request.format.fragmented);
        assert!(request.audio.is_none());
    }

    #[tokio::test]
    async fn custom_key_skips_download() {
        let server = MockServer::start().await;
        let playlist = "#EXTM3U\n#EXT-X-TARGETDURATION:10\n\
            #EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\"\n\
            #EXTINF:10.0,\nseg0.ts\n#EXT-X-ENDLIST\n";
        serve(&server, "/index.m3u8", playlist.as_bytes()).await;
        Mock::given(method("GET"))
            .and(path("/key.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 16]))
            .expect(0)
            .mount(&server)
            .await;

        let request = resolver(None)
            .with_custom_key(Bytes::from_static(KEY))
            .resolve(&format!("{}/index.m3u8", server.uri()))
            .await
            .unwrap();
        assert_eq!(request.crypto.key.as_ref(), KEY);
    }

    #[tokio::test]
    async fn downloaded_key_must_be_sixteen_bytes() {
        let server = MockServer::start().await;
        let playlist = "#EXTM3U\n#EXT-X-TARGETDURATION:10\n\
            #EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\"\n\
            #EXTINF:10.0,\nseg0.ts\n#EXT-X-ENDLIST\n";
        serve(&server, "/index.m3u8", playlist.as_bytes()).await;
        serve(&server, "/key.bin", b"short").await;

        let err = resolver(None)
            .resolve(&format!("{}/index.m3u8", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidKey(5)));
    }

    #[tokio::test]
    async fn master_playlist_selects_first_variant_and_default_audio() {
        let server = MockServer::start().await;
        let master = "#EXTM3U\n\
            #EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aud\",NAME=\"en\",DEFAULT=NO,URI=\"audio/en.m3u8\"\n\
            #EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aud\",NAME=\"ja\",DEFAULT=YES,URI=\"audio/ja.m3u8\"\n\
            #EXT-X-STREAM-INF:BANDWIDTH=800000,AUDIO=\"aud\"\nlow/index.m3u8\n\
            #EXT-X-STREAM-INF:BANDWIDTH=2400000,AUDIO=\"aud\"\nhigh/index.m3u8\n";
        let media = "#EXTM3U\n#EXT-X-TARGETDURATION:6\n#EXT-X-MAP:URI=\"init.mp4\"\n\
            #EXTINF:6.0,\nseg0.m4s\n#EXTINF:6.0,\nseg1.m4s\n#EXT-X-ENDLIST\n";
        let audio = "#EXTM3U\n#EXT-X-TARGETDURATION:6\n#EXT-X-MAP:URI=\"ainit.mp4\"\n\
            #EXTINF:6.0,\na0.m4s\n#EXT-X-ENDLIST\n";
        serve(&server, "/master.m3u8", master.as_bytes()).await;
        serve(&server, "/low/index.m3u8", media.as_bytes()).await;
        serve(&server, "/audio/ja.m3u8", audio.as_bytes()).await;

        let request = resolver(None)
            .resolve(&format!("{}/master.m3u8", server.uri()))
            .await
            .unwrap();

        let base = server.uri();
        assert_eq!(request.video[0].location, format!("{base}/low/seg0.m4s"));
        assert!(request.format.fragmented);
        assert_eq!(
            request.format.init_locator.as_ref().map(|l| l.location.clone()),
            Some(format!("{base}/low/init.mp4"))
        );
        let audio = request.audio.as_ref().unwrap();
        assert_eq!(audio.len(), 1);
        assert_eq!(audio[0].location, format!("{base}/audio/a0.m4s"));
        assert_eq!(
            request
                .format
                .audio_init_locator
                .as_ref()
                .map(|l| l.location.clone()),
            Some(format!("{base}/audio/ainit.mp4"))
        );
    }

    #[tokio::test]
    async fn playlist_requests_carry_custom_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/index.m3u8"))
            .and(header("x-token", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "#EXTM3U\n#EXT-X-TARGETDURATION:10\n#EXTINF:10.0,\nseg0.ts\n#EXT-X-ENDLIST\n",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let headers = crate::headers::parse_headers(&["X-Token: secret".to_string()]).unwrap();
        let config = DownloaderConfig::default().with_headers(headers);
        let request = PlaylistResolver::new(&config, None)
            .unwrap()
            .resolve(&format!("{}/index.m3u8", server.uri()))
            .await
            .unwrap();
        assert_eq!(request.video.len(), 1);
    }

    #[tokio::test]
    async fn local_playlist_uses_base_url() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("local.m3u8");
        std::fs::write(
            &file,
            "#EXTM3U\n#EXT-X-TARGETDURATION:10\n#EXTINF:10.0,\nparts/seg0.ts\n\
             #EXTINF:10.0,\nhttps://mirror.example.com/seg1.ts\n#EXT-X-ENDLIST\n",
        )
        .unwrap();
        let input = file.to_string_lossy().into_owned();

        let request = resolver(Some("https://cdn.example.com/show/"))
            .resolve(&input)
            .await
            .unwrap();
        assert_eq!(
            request.video[0].location,
            "https://cdn.example.com/show/parts/seg0.ts"
        );
        assert_eq!(request.video[1].location, "https://mirror.example.com/seg1.ts");

        let err = resolver(None).resolve(&input).await.unwrap_err();
        assert!(matches!(err, AppError::Playlist(_)));
    }

    #[tokio::test]
    async fn empty_playlist_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("empty.m3u8");
        std::fs::write(&file, "#EXTM3U\n#EXT-X-TARGETDURATION:10\n#EXT-X-ENDLIST\n").unwrap();

        let err = resolver(None)
            .resolve(&file.to_string_lossy())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Playlist(_)));
    }

    #[tokio::test]
    async fn unsupported_method_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("sample.m3u8");
        std::fs::write(
            &file,
            "#EXTM3U\n#EXT-X-TARGETDURATION:10\n\
             #EXT-X-KEY:METHOD=SAMPLE-AES,URI=\"https://k.example.com/k\"\n\
             #EXTINF:10.0,\nhttps://cdn.example.com/seg0.ts\n#EXT-X-ENDLIST\n",
        )
        .unwrap();

        let err = resolver(None)
            .resolve(&file.to_string_lossy())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Playlist(_)));
    }
}
