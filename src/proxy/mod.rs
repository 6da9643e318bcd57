pub mod stream;
pub mod translate;

pub use stream::StreamEngine;
pub use translate::{translate_request, TranslatedRequest};
