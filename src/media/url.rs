//! Decodes media CDN URLs into a canonical base (one key per logical asset),
//! the requested format/size variant, the size table the asset belongs to,
//! and the full-resolution URL.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use crate::error::{Error, Result};

/// Closed set of variant tables. `Single` is for assets that come in exactly
/// one rendition (static placeholders and such).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SizeClass {
    Media,
    ProfileImage,
    ProfileBanner,
    CardImage,
    Single,
}

type SizeRow = (u32, u32, &'static [&'static str]);

static MEDIA_SIZES: &[SizeRow] = &[
    (64, 64, &["tiny"]),
    (120, 120, &["120x120"]),
    (240, 240, &["240x240"]),
    (360, 360, &["360x360"]),
    (680, 680, &["small"]),
    (900, 900, &["900x900"]),
    (1200, 1200, &["medium"]),
    (2048, 2048, &["large"]),
    (4096, 4096, &["4096x4096", "orig"]),
];

static PROFILE_IMAGE_SIZES: &[SizeRow] = &[
    (24, 24, &["_mini"]),
    (48, 48, &["_normal"]),
    (73, 73, &["_bigger"]),
    (96, 96, &["_x96"]),
    (128, 128, &["_reasonably_small"]),
    (200, 200, &["_200x200"]),
    (400, 400, &["_400x400"]),
    (4096, 4096, &[""]), // assumed maximum
];

// aspect ratio 3:1
static PROFILE_BANNER_SIZES: &[SizeRow] = &[
    (300, 100, &["/300x100"]),
    (600, 200, &["/600x200"]),
    (626, 313, &["/ipad"]),
    (1080, 360, &["/1080x360"]),
    (1500, 500, &["/1500x500"]),
    (4096, 4096, &[""]),
];

static CARD_IMAGE_SIZES: &[SizeRow] = &[
    (100, 100, &["100x100"]),
    (100, 100, &["100x100_2"]),
    (144, 144, &["144x144"]),
    (144, 144, &["144x144_2"]),
    (120, 120, &["120x120"]),
    (240, 240, &["240x240"]),
    (280, 150, &["280x150"]), // non-square
    (280, 280, &["280x280"]),
    (280, 280, &["280x280_2"]),
    (360, 360, &["360x360"]),
    (386, 202, &["386x202"]), // non-square
    (400, 400, &["400x400"]),
    (420, 420, &["420x420_1"]),
    (420, 420, &["420x420_2"]),
    (600, 314, &["600x314"]), // non-square
    (600, 600, &["600x600"]),
    (680, 680, &["small"]), // assume it means the same thing as in MEDIA_SIZES
    (800, 320, &["800x320_1"]), // non-square
    (800, 419, &["800x419"]), // non-square
    (900, 900, &["900x900"]),
    (1000, 1000, &["1000x1000"]),
    (1200, 627, &["1200x627"]), // non-square
    (1200, 1200, &["medium"]),
    (2048, 2048, &["2048x2048_2_exp"]),
    (2048, 2048, &["large"]),
    (4096, 4096, &["4096x4096", "orig"]),
];

impl SizeClass {
    fn table(self) -> &'static [SizeRow] {
        match self {
            SizeClass::Media => MEDIA_SIZES,
            SizeClass::ProfileImage => PROFILE_IMAGE_SIZES,
            SizeClass::ProfileBanner => PROFILE_BANNER_SIZES,
            SizeClass::CardImage => CARD_IMAGE_SIZES,
            SizeClass::Single => &[],
        }
    }

    /// Rank of a variant within the table, smallest rendition first. A
    /// single-rendition asset ranks its (absent) variant at zero.
    pub fn rank(self, variant: Option<&str>) -> Option<usize> {
        match (self, variant) {
            (SizeClass::Single, None) => Some(0),
            (_, None) => None,
            (_, Some(name)) => self
                .table()
                .iter()
                .position(|(_, _, names)| names.contains(&name)),
        }
    }

    pub fn valid(self, variant: &str) -> bool {
        self.rank(Some(variant)).is_some()
    }
}

/// Decoded form of a media URL. `sizes` is `None` for raw video assets,
/// which have bitrate variants rather than size variants.
#[derive(Clone, Debug)]
pub struct DecodedUrl {
    pub base: String,
    pub format: Option<String>,
    pub variant: Option<String>,
    pub sizes: Option<SizeClass>,
    pub fullres: Option<String>,
}

impl DecodedUrl {
    pub fn is_video(&self) -> bool {
        self.sizes.is_none()
    }
}

const VIDEO_HOSTS: &[&str] = &["video.twimg.com", "video-ft.twimg.com", "video-cf.twimg.com"];

const SINGLETON_URLS: &[&str] = &[
    "https://pbs.twimg.com/cards/player-placeholder.png",
    "https://pbs.twimg.com/lex/placeholder_live_nomargin.png",
];

macro_rules! path_re {
    ($name:ident, $re:literal) => {
        static $name: Lazy<Regex> = Lazy::new(|| Regex::new($re).unwrap());
    };
}

path_re!(EXT_TW_VIDEO, r"^/ext_tw_video/[0-9]+/.*/([A-Za-z0-9_-]+)\.(mp4|m4s|m3u8|ts)$");
path_re!(TWEET_VIDEO, r"^/tweet_video/([A-Za-z0-9_-]+)\.(mp4)$");
path_re!(DM_GIF, r"^/dm_gif/([0-9]+)/([A-Za-z0-9_-]+)\.(mp4)$");
path_re!(DM_VIDEO, r"^/dm_video/[0-9]+/.*/([A-Za-z0-9_-]+)\.(mp4|m4s|m3u8)$");
path_re!(AMPLIFY_VIDEO, r"^/amplify_video/[0-9]+/.*/([A-Za-z0-9_-]+)\.(mp4|m4s|m3u8)$");

// Some very old accounts predate the random-letter renaming of profile
// images, so the stem is matched loosely.
path_re!(
    PROFILE_IMAGES,
    r"^(/profile_images/([0-9]+)/(.+?))(_(normal|bigger|x96|reasonably_small|mini|200x200|400x400))?(\.([A-Za-z0-9]{1,5}))?$"
);
path_re!(
    PROFILE_BANNERS,
    r"^(/profile_banners/([0-9]+)/([0-9]+))(/(300x100|600x200|1080x360|1500x500|ipad))?$"
);
path_re!(
    MEDIA,
    r"^(/media/([A-Za-z0-9_-]+))(\.([A-Za-z0-9]{1,5}))?(:([a-z0-9_]+))?$"
);
path_re!(
    AMPLIFY_THUMB,
    r"^(/amplify_video_thumb/([0-9]+)/img/([A-Za-z0-9_-]+))(\.([A-Za-z0-9]{1,5}))?$"
);
path_re!(
    EXT_TW_VIDEO_THUMB,
    r"^(/ext_tw_video_thumb/([0-9]+)/p[ur]/img/([A-Za-z0-9_-]+))(\.([A-Za-z0-9]{1,5}))?$"
);
path_re!(
    TWEET_VIDEO_THUMB,
    r"^(/tweet_video_thumb/([A-Za-z0-9_-]+))(\.([A-Za-z0-9]{1,5}))?$"
);
path_re!(CARD_IMG, r"^(/card_img/([0-9]+)/([A-Za-z0-9_-]+))$");
path_re!(SEMANTIC_CORE_IMG, r"^(/semantic_core_img/([0-9]+)/([A-Za-z0-9_-]+))$");
path_re!(AD_IMG, r"^(/ad_img/([0-9]+)/([A-Za-z0-9_-]+))$");
path_re!(COMMUNITY_BANNER, r"^(/community_banner_img/([0-9]+)/([A-Za-z0-9_-]+))$");
path_re!(LIST_BANNER, r"^(/list_banner_img/([0-9]+)/([A-Za-z0-9_-]+))$");
path_re!(
    DM_GIF_PREVIEW,
    r"^(/dm_gif_preview/([0-9]+)/([A-Za-z0-9_-]+))(\.([A-Za-z0-9]{1,5}))?$"
);
path_re!(
    DM_VIDEO_PREVIEW,
    r"^(/dm_video_preview/([0-9]+)/img/([A-Za-z0-9_-]+))(\.([A-Za-z0-9]{1,5}))?$"
);
path_re!(GROK_IMG_SHARE, r"^(/grok-img-share/([0-9]+))\.([A-Za-z0-9]{1,5})$");
path_re!(STATIC_IMG, r"^(/static/.*)$");

fn unrecognized(url: &str, why: &str) -> Error {
    Error::UnrecognizedMediaUrl(format!("{url} ({why})"))
}

pub fn decode_media_url(orig_url: &str) -> Result<DecodedUrl> {
    // Playlists reference assets by absolute path; those always belong to
    // the post-media CDN host.
    let absolute;
    let orig = if orig_url.starts_with('/') {
        absolute = format!("https://pbs.twimg.com{orig_url}");
        absolute.as_str()
    } else {
        orig_url
    };

    let url = Url::parse(orig).map_err(|err| unrecognized(orig_url, &err.to_string()))?;
    let host = url.host_str().unwrap_or("");
    let path = url.path().to_owned();

    if host == "abs.twimg.com" || SINGLETON_URLS.contains(&orig) {
        return Ok(DecodedUrl {
            base: format!("{host}{path}"),
            format: None,
            variant: None,
            sizes: Some(SizeClass::Single),
            fullres: None,
        });
    }

    if VIDEO_HOSTS.contains(&host) {
        let base = if path.starts_with("/ext_tw_video/") {
            let m = EXT_TW_VIDEO
                .captures(&path)
                .ok_or_else(|| unrecognized(orig_url, "video path shape"))?;
            format!("{host}/{}.{}", &m[1], &m[2])
        } else if path.starts_with("/tweet_video/") {
            let m = TWEET_VIDEO
                .captures(&path)
                .ok_or_else(|| unrecognized(orig_url, "video path shape"))?;
            format!("{host}/{}.{}", &m[1], &m[2])
        } else if path.starts_with("/subtitles/") {
            format!("{host}{path}")
        } else if path.starts_with("/dm_gif/") {
            DM_GIF
                .captures(&path)
                .ok_or_else(|| unrecognized(orig_url, "video path shape"))?;
            format!("{host}{path}")
        } else if path.starts_with("/dm_video/") {
            DM_VIDEO
                .captures(&path)
                .ok_or_else(|| unrecognized(orig_url, "video path shape"))?;
            format!("{host}{path}")
        } else if path.starts_with("/amplify_video/") {
            let m = AMPLIFY_VIDEO
                .captures(&path)
                .ok_or_else(|| unrecognized(orig_url, "video path shape"))?;
            format!("{host}/{}.{}", &m[1], &m[2])
        } else {
            return Err(unrecognized(orig_url, "unknown video path family"));
        };
        return Ok(DecodedUrl {
            base,
            format: None,
            variant: None,
            sizes: None,
            fullres: None,
        });
    }

    if host != "pbs.twimg.com" {
        return Err(unrecognized(orig_url, "unknown host"));
    }

    let mut query: HashMap<String, String> = HashMap::new();
    for (k, v) in url.query_pairs() {
        if query.insert(k.into_owned(), v.into_owned()).is_some() {
            return Err(unrecognized(orig_url, "repeated query parameter"));
        }
    }

    let mut ext: Option<String> = None;
    let mut variant: Option<String> = None;
    let mut sizes = SizeClass::Media;
    // {base} / {ext} placeholders, resolved below.
    let mut fullres_fmt = "{base}?format={ext}&name=orig";
    let default_variant: Option<&str>;
    let base;

    if path.starts_with("/profile_images/") {
        let m = PROFILE_IMAGES
            .captures(&path)
            .ok_or_else(|| unrecognized(orig_url, "profile image path"))?;
        base = m[1].to_owned();
        variant = Some(m.get(4).map(|g| g.as_str()).unwrap_or("").to_owned());
        ext = m.get(7).map(|g| g.as_str().to_owned()); // sometimes missing
        sizes = SizeClass::ProfileImage;
        fullres_fmt = "{base}.{ext}";
        default_variant = Some("");
        if !query.is_empty() {
            return Err(unrecognized(orig_url, "unexpected query"));
        }
    } else if path.starts_with("/profile_banners/") {
        let m = PROFILE_BANNERS
            .captures(&path)
            .ok_or_else(|| unrecognized(orig_url, "profile banner path"))?;
        base = m[1].to_owned();
        variant = Some(m.get(4).map(|g| g.as_str()).unwrap_or("").to_owned());
        sizes = SizeClass::ProfileBanner;
        fullres_fmt = "{base}";
        default_variant = Some("");
        if !query.is_empty() {
            return Err(unrecognized(orig_url, "unexpected query"));
        }
    } else if path.starts_with("/media/") {
        let m = MEDIA
            .captures(&path)
            .ok_or_else(|| unrecognized(orig_url, "media path"))?;
        base = m[1].to_owned();
        ext = m.get(4).map(|g| g.as_str().to_owned());
        variant = m.get(6).map(|g| g.as_str().to_owned());
        default_variant = Some("medium"); // sometimes
    } else if path.starts_with("/amplify_video_thumb/") {
        let m = AMPLIFY_THUMB
            .captures(&path)
            .ok_or_else(|| unrecognized(orig_url, "amplify thumb path"))?;
        base = m[1].to_owned();
        ext = m.get(5).map(|g| g.as_str().to_owned());
        default_variant = Some("medium"); // maybe
    } else if path.starts_with("/ext_tw_video_thumb/") {
        let m = EXT_TW_VIDEO_THUMB
            .captures(&path)
            .ok_or_else(|| unrecognized(orig_url, "video thumb path"))?;
        base = m[1].to_owned();
        ext = m.get(5).map(|g| g.as_str().to_owned());
        default_variant = Some("medium");
    } else if path.starts_with("/tweet_video_thumb/") {
        let m = TWEET_VIDEO_THUMB
            .captures(&path)
            .ok_or_else(|| unrecognized(orig_url, "gif thumb path"))?;
        base = m[1].to_owned();
        ext = m.get(4).map(|g| g.as_str().to_owned());
        default_variant = Some("medium"); // probably
    } else if path.starts_with("/card_img/") {
        let m = CARD_IMG
            .captures(&path)
            .ok_or_else(|| unrecognized(orig_url, "card image path"))?;
        base = m[1].to_owned();
        sizes = SizeClass::CardImage;
        default_variant = None; // won't load without size
    } else if path.starts_with("/semantic_core_img/") {
        let m = SEMANTIC_CORE_IMG
            .captures(&path)
            .ok_or_else(|| unrecognized(orig_url, "semantic core path"))?;
        base = m[1].to_owned();
        default_variant = None;
    } else if path.starts_with("/ad_img/") {
        let m = AD_IMG
            .captures(&path)
            .ok_or_else(|| unrecognized(orig_url, "ad image path"))?;
        base = m[1].to_owned();
        default_variant = None;
    } else if path.starts_with("/community_banner_img/") {
        let m = COMMUNITY_BANNER
            .captures(&path)
            .ok_or_else(|| unrecognized(orig_url, "community banner path"))?;
        base = m[1].to_owned();
        default_variant = None;
    } else if path.starts_with("/list_banner_img/") {
        let m = LIST_BANNER
            .captures(&path)
            .ok_or_else(|| unrecognized(orig_url, "list banner path"))?;
        base = m[1].to_owned();
        default_variant = None;
    } else if path.starts_with("/dm_gif_preview/") {
        let m = DM_GIF_PREVIEW
            .captures(&path)
            .ok_or_else(|| unrecognized(orig_url, "dm gif preview path"))?;
        base = m[1].to_owned();
        ext = m.get(5).map(|g| g.as_str().to_owned());
        default_variant = Some("small");
    } else if path.starts_with("/dm_video_preview/") {
        let m = DM_VIDEO_PREVIEW
            .captures(&path)
            .ok_or_else(|| unrecognized(orig_url, "dm video preview path"))?;
        base = m[1].to_owned();
        ext = m.get(5).map(|g| g.as_str().to_owned());
        default_variant = None;
    } else if path.starts_with("/grok-img-share/") {
        let m = GROK_IMG_SHARE
            .captures(&path)
            .ok_or_else(|| unrecognized(orig_url, "grok image path"))?;
        base = m[1].to_owned();
        ext = Some(m[3].to_owned());
        sizes = SizeClass::Single;
        default_variant = None;
    } else if path.starts_with("/static/") {
        let m = STATIC_IMG
            .captures(&path)
            .ok_or_else(|| unrecognized(orig_url, "static path"))?;
        base = m[1].to_owned();
        sizes = SizeClass::Single;
        default_variant = None;
    } else {
        return Err(unrecognized(orig_url, "unknown path family"));
    }

    if let Some(fmt) = query.remove("format") {
        if ext.is_some() {
            return Err(unrecognized(orig_url, "format given twice"));
        }
        if !matches!(fmt.as_str(), "jpg" | "png") {
            return Err(unrecognized(orig_url, "unexpected format parameter"));
        }
        ext = Some(fmt);
    } else if let Some(e) = &ext {
        if e.eq_ignore_ascii_case("jpeg") {
            ext = Some("jpg".to_owned());
        }
    }

    if let Some(name) = query.remove("name") {
        if variant.as_deref().is_some_and(|v| !v.is_empty()) {
            return Err(unrecognized(orig_url, "size given twice"));
        }
        variant = Some(name);
    }

    let variant = variant
        .filter(|v| !v.is_empty())
        .or_else(|| default_variant.map(str::to_owned));

    if let Some(v) = &variant {
        if !sizes.valid(v) {
            return Err(unrecognized(orig_url, "unknown size variant"));
        }
    }
    if let Some(e) = &ext {
        // more is allowed when the extension is part of the filename
        if !matches!(
            e.to_ascii_lowercase().as_str(),
            "jpg" | "jpeg" | "png" | "gif" | "bmp"
        ) {
            return Err(unrecognized(orig_url, "unexpected extension"));
        }
    }
    if !query.is_empty() {
        return Err(unrecognized(orig_url, "unexpected query"));
    }

    let mut fullres = fullres_fmt
        .replace("{base}", &base)
        .replace("{ext}", ext.as_deref().unwrap_or(""));
    if ext.is_none() && fullres.ends_with('.') {
        // profile images occasionally come without an extension
        fullres.pop();
    }
    Ok(DecodedUrl {
        base,
        format: ext,
        variant,
        sizes: Some(sizes),
        fullres: Some(format!("https://pbs.twimg.com{fullres}")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_media_with_name_query() {
        let d = decode_media_url("https://pbs.twimg.com/media/ABC_d.jpg?name=large").unwrap();
        assert_eq!(d.base, "/media/ABC_d");
        assert_eq!(d.format.as_deref(), Some("jpg"));
        assert_eq!(d.variant.as_deref(), Some("large"));
        assert_eq!(d.sizes, Some(SizeClass::Media));
        assert_eq!(
            d.fullres.as_deref(),
            Some("https://pbs.twimg.com/media/ABC_d?format=jpg&name=orig")
        );
    }

    #[test]
    fn decode_is_stable_over_fullres() {
        let d = decode_media_url("https://pbs.twimg.com/media/ABC_d.jpg?name=large").unwrap();
        let d2 = decode_media_url(d.fullres.as_deref().unwrap()).unwrap();
        assert_eq!(d2.base, d.base);
        assert_eq!(d2.format, d.format);
        assert_eq!(d2.variant.as_deref(), Some("orig"));
    }

    #[test]
    fn post_media_defaults_to_medium() {
        let d = decode_media_url("https://pbs.twimg.com/media/xyz.png").unwrap();
        assert_eq!(d.variant.as_deref(), Some("medium"));
        assert_eq!(d.format.as_deref(), Some("png"));
    }

    #[test]
    fn post_media_colon_variant() {
        let d = decode_media_url("https://pbs.twimg.com/media/xyz.jpg:large").unwrap();
        assert_eq!(d.base, "/media/xyz");
        assert_eq!(d.variant.as_deref(), Some("large"));
    }

    #[test]
    fn jpeg_folds_to_jpg() {
        let d = decode_media_url("https://pbs.twimg.com/media/xyz.JPEG").unwrap();
        assert_eq!(d.format.as_deref(), Some("jpg"));
    }

    #[test]
    fn profile_image_variants() {
        let d = decode_media_url("https://pbs.twimg.com/profile_images/123/pic_normal.jpg")
            .unwrap();
        assert_eq!(d.base, "/profile_images/123/pic");
        assert_eq!(d.variant.as_deref(), Some("_normal"));
        assert_eq!(d.sizes, Some(SizeClass::ProfileImage));
        assert_eq!(
            d.fullres.as_deref(),
            Some("https://pbs.twimg.com/profile_images/123/pic.jpg")
        );
    }

    #[test]
    fn profile_banner_variants() {
        let d =
            decode_media_url("https://pbs.twimg.com/profile_banners/123/1500000000/600x200")
                .unwrap();
        assert_eq!(d.base, "/profile_banners/123/1500000000");
        assert_eq!(d.variant.as_deref(), Some("/600x200"));
        assert_eq!(d.sizes, Some(SizeClass::ProfileBanner));
    }

    #[test]
    fn card_image_needs_explicit_size() {
        let d = decode_media_url("https://pbs.twimg.com/card_img/456/abc?format=jpg&name=small")
            .unwrap();
        assert_eq!(d.base, "/card_img/456/abc");
        assert_eq!(d.variant.as_deref(), Some("small"));
        assert_eq!(d.sizes, Some(SizeClass::CardImage));

        let bare = decode_media_url("https://pbs.twimg.com/card_img/456/abc").unwrap();
        assert_eq!(bare.variant, None);
    }

    #[test]
    fn ext_video_bases_collapse_variants() {
        let a = decode_media_url(
            "https://video.twimg.com/ext_tw_video/1/pu/vid/avc1/640x360/clip.mp4",
        )
        .unwrap();
        let b =
            decode_media_url("https://video.twimg.com/ext_tw_video/1/pu/vid/1280x720/clip.mp4")
                .unwrap();
        assert_eq!(a.base, "video.twimg.com/clip.mp4");
        assert_eq!(a.base, b.base);
        assert!(a.is_video());
    }

    #[test]
    fn abs_assets_are_single_variant() {
        let d = decode_media_url("https://abs.twimg.com/sticky/illustrations/x.png").unwrap();
        assert_eq!(d.sizes, Some(SizeClass::Single));
        assert_eq!(d.base, "abs.twimg.com/sticky/illustrations/x.png");
    }

    #[test]
    fn unknown_host_is_rejected() {
        assert!(matches!(
            decode_media_url("https://example.com/media/x.jpg"),
            Err(Error::UnrecognizedMediaUrl(_))
        ));
    }

    #[test]
    fn size_rank_orders_variants() {
        let small = SizeClass::Media.rank(Some("small")).unwrap();
        let large = SizeClass::Media.rank(Some("large")).unwrap();
        let orig = SizeClass::Media.rank(Some("orig")).unwrap();
        assert!(small < large);
        assert!(large < orig);
        assert_eq!(SizeClass::Single.rank(None), Some(0));
    }
}
