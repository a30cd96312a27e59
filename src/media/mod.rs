pub mod store;
pub mod url;

pub use store::MediaStore;
pub use url::{decode_media_url, DecodedUrl, SizeClass};
