use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use validator::Validate;

/// container of a candidate stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamFormat {
    Mp4,
    Hls,
}

impl StreamFormat {
    /// used when an extractor doesn't say what it found
    pub fn infer(url: &str) -> Self {
        if url.to_ascii_lowercase().contains("m3u8") {
            Self::Hls
        } else {
            Self::Mp4
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    #[error("stream url `{0}` is not absolute")]
    NotAbsolute(String),

    #[error("stream url `{0}` is not http(s)")]
    UnsupportedScheme(String),

    #[error("stream url `{url}` can't be resolved against `{page_url}`")]
    Unresolvable { url: String, page_url: String },
}

/// one candidate stream of a video
///
/// the url is always absolute, construction goes through [`StreamDescriptor::new`] or
/// [`StreamDescriptor::resolve`] which both refuse anything else
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamDescriptor {
    quality: String,
    format: StreamFormat,
    url: String,
}

impl StreamDescriptor {
    pub fn new(
        quality: impl Into<String>,
        format: StreamFormat,
        url: impl Into<String>,
    ) -> Result<Self, DescriptorError> {
        let url = url.into().trim().to_string();
        let parsed = Url::parse(&url).map_err(|_| DescriptorError::NotAbsolute(url.clone()))?;

        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(DescriptorError::UnsupportedScheme(url));
        }

        Ok(Self {
            quality: quality.into(),
            format,
            url,
        })
    }

    /// resolves `raw_url` against the page it was scraped from first, so relative and
    /// protocol-relative urls from page markup become absolute
    pub fn resolve(
        quality: impl Into<String>,
        format: StreamFormat,
        raw_url: &str,
        page_url: &str,
    ) -> Result<Self, DescriptorError> {
        let raw_url = raw_url.trim();
        if raw_url.starts_with("http://") || raw_url.starts_with("https://") {
            return Self::new(quality, format, raw_url);
        }

        let unresolvable = || DescriptorError::Unresolvable {
            url: raw_url.to_string(),
            page_url: page_url.to_string(),
        };

        let resolved = Url::parse(page_url)
            .and_then(|base| base.join(raw_url))
            .map_err(|_| unresolvable())?;

        Self::new(quality, format, resolved.to_string())
    }

    pub fn quality(&self) -> &str {
        &self.quality
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_hls(&self) -> bool {
        self.format == StreamFormat::Hls
    }

    /// swaps in a proxy-wrapped url, the wrapped url is absolute whenever the api base is
    pub(crate) fn with_url(mut self, url: String) -> Self {
        self.url = url;
        self
    }
}

/// every playable rendition of one video plus the one a player should start with
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StreamSet {
    streams: Vec<StreamDescriptor>,
    default: Option<String>,
    has_video: bool,
}

impl StreamSet {
    /// `default` has to be the url of one of `streams`, anything else is dropped
    pub fn new(streams: Vec<StreamDescriptor>, default: Option<String>) -> Self {
        let default = default.filter(|d| streams.iter().any(|s| s.url() == d));
        let has_video = !streams.is_empty();
        Self {
            streams,
            default,
            has_video,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn streams(&self) -> &[StreamDescriptor] {
        &self.streams
    }

    pub fn default_url(&self) -> Option<&str> {
        self.default.as_deref()
    }

    pub fn default_stream(&self) -> Option<&StreamDescriptor> {
        let default = self.default.as_deref()?;
        self.streams.iter().find(|s| s.url() == default)
    }

    pub fn has_video(&self) -> bool {
        self.has_video
    }

    pub fn into_parts(self) -> (Vec<StreamDescriptor>, Option<String>) {
        (self.streams, self.default)
    }
}

/// one stream as an extractor hands it over, nothing here is trusted yet
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RawStream {
    #[validate(length(min = 1, max = 64))]
    pub quality: String,

    #[serde(default)]
    pub format: Option<StreamFormat>,

    #[validate(length(min = 1, max = 8192))]
    pub url: String,
}

/// StreamSet-shaped output of a site extractor, only the shape gets validated
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ExtractorOutput {
    #[validate(nested)]
    pub streams: Vec<RawStream>,

    // the extractor's own pick, ranking decides the real default
    #[serde(default)]
    pub default: Option<String>,

    #[serde(default)]
    pub has_video: Option<bool>,

    // page the streams were scraped from, needed for relative stream urls
    #[serde(default)]
    #[validate(url)]
    pub page_url: Option<String>,
}
