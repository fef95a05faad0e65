#![forbid(unsafe_code)]

//! Per-site knobs for yt-dlp. Instagram and Facebook need browser-like
//! headers, optional cookies and id-based filenames because their titles are
//! full of emoji; everything else uses the stock behaviour.

use std::path::PathBuf;

use crate::config::CookieFiles;

pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
pub const ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";

const INSTAGRAM_DOMAINS: &[&str] = &["instagram.com", "instagr.am"];
const FACEBOOK_DOMAINS: &[&str] = &[
    "facebook.com",
    "fb.com",
    "fb.watch",
    "m.facebook.com",
    "fbcdn.net",
];
const TIKTOK_DOMAINS: &[&str] = &["tiktok.com"];
const YOUTUBE_DOMAINS: &[&str] = &["youtube.com", "youtu.be"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Platform {
    YouTube,
    TikTok,
    Instagram,
    Facebook,
    Other,
}

/// Extra request settings yt-dlp needs for a given URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOptions {
    pub headers: Vec<(&'static str, String)>,
    pub cookies_file: Option<PathBuf>,
}

impl Platform {
    pub fn detect(url: &str) -> Self {
        let url = url.to_ascii_lowercase();
        let matches = |domains: &[&str]| domains.iter().any(|domain| url.contains(domain));
        if matches(INSTAGRAM_DOMAINS) {
            Self::Instagram
        } else if matches(FACEBOOK_DOMAINS) {
            Self::Facebook
        } else if matches(TIKTOK_DOMAINS) {
            Self::TikTok
        } else if matches(YOUTUBE_DOMAINS) {
            Self::YouTube
        } else {
            Self::Other
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::YouTube => "youtube",
            Self::TikTok => "tiktok",
            Self::Instagram => "instagram",
            Self::Facebook => "facebook",
            Self::Other => "other",
        }
    }

    /// Instagram and Facebook name files after the media id with restricted
    /// characters; the rest keep the human-readable title.
    pub fn uses_id_filenames(self) -> bool {
        matches!(self, Self::Instagram | Self::Facebook)
    }

    pub fn output_template(self) -> &'static str {
        if self.uses_id_filenames() {
            "%(id)s.%(ext)s"
        } else {
            "%(title)s.%(ext)s"
        }
    }

    /// Instagram/Facebook usually expose a single muxed stream, so merging
    /// separate video and audio tracks tends to fail there.
    pub fn default_format(self) -> &'static str {
        if self.uses_id_filenames() {
            "best"
        } else {
            "bestvideo+bestaudio/best"
        }
    }

    fn site_origin(self) -> Option<&'static str> {
        match self {
            Self::Instagram => Some("https://www.instagram.com"),
            Self::Facebook => Some("https://www.facebook.com"),
            _ => None,
        }
    }

    pub fn request_options(self, cookies: &CookieFiles) -> RequestOptions {
        let mut headers = vec![
            ("User-Agent", BROWSER_USER_AGENT.to_string()),
            ("Accept-Language", ACCEPT_LANGUAGE.to_string()),
        ];
        if let Some(origin) = self.site_origin() {
            headers.push(("Referer", format!("{origin}/")));
            headers.push(("Origin", origin.to_string()));
        }

        let configured = match self {
            Self::Instagram => cookies.instagram.as_ref(),
            Self::Facebook => cookies.facebook.as_ref(),
            _ => None,
        };
        let cookies_file = configured.filter(|path| path.is_file()).cloned();

        RequestOptions {
            headers,
            cookies_file,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_recognizes_supported_sites() {
        assert_eq!(
            Platform::detect("https://www.youtube.com/watch?v=dQw4w9WgXcQ"),
            Platform::YouTube
        );
        assert_eq!(Platform::detect("https://youtu.be/dQw4w9WgXcQ"), Platform::YouTube);
        assert_eq!(
            Platform::detect("https://vm.tiktok.com/ZMabc/"),
            Platform::TikTok
        );
        assert_eq!(
            Platform::detect("https://www.Instagram.com/reel/xyz/"),
            Platform::Instagram
        );
        assert_eq!(Platform::detect("https://instagr.am/p/xyz"), Platform::Instagram);
        assert_eq!(Platform::detect("https://fb.watch/abc/"), Platform::Facebook);
        assert_eq!(
            Platform::detect("https://m.facebook.com/watch/?v=1"),
            Platform::Facebook
        );
        assert_eq!(Platform::detect("https://vimeo.com/1"), Platform::Other);
    }

    #[test]
    fn naming_and_format_defaults_follow_platform() {
        assert_eq!(Platform::Instagram.output_template(), "%(id)s.%(ext)s");
        assert_eq!(Platform::Facebook.default_format(), "best");
        assert_eq!(Platform::YouTube.output_template(), "%(title)s.%(ext)s");
        assert_eq!(Platform::TikTok.default_format(), "bestvideo+bestaudio/best");
        assert!(!Platform::Other.uses_id_filenames());
    }

    #[test]
    fn social_sites_send_referer_and_origin() {
        let options = Platform::Instagram.request_options(&CookieFiles::default());
        assert!(
            options
                .headers
                .contains(&("Referer", "https://www.instagram.com/".to_string()))
        );
        assert!(
            options
                .headers
                .contains(&("Origin", "https://www.instagram.com".to_string()))
        );

        let plain = Platform::YouTube.request_options(&CookieFiles::default());
        assert_eq!(plain.headers.len(), 2);
        assert!(plain.headers.iter().all(|(name, _)| *name != "Referer"));
    }

    #[test]
    fn cookies_are_only_used_when_the_file_exists() {
        let dir = tempfile::tempdir().unwrap();
        let jar = dir.path().join("cookies.txt");
        std::fs::write(&jar, "# Netscape HTTP Cookie File\n").unwrap();
        let cookies = CookieFiles {
            instagram: Some(jar.clone()),
            facebook: Some(dir.path().join("missing.txt")),
        };

        assert_eq!(
            Platform::Instagram.request_options(&cookies).cookies_file,
            Some(jar)
        );
        assert_eq!(Platform::Facebook.request_options(&cookies).cookies_file, None);
        assert_eq!(Platform::YouTube.request_options(&cookies).cookies_file, None);
    }
}
