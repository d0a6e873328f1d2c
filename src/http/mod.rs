//! HTTP/1.x message model and wire codec.

pub mod codec;
pub mod frame;
pub mod headers;

#[doc(inline)]
pub use codec::{ClientCodec, CodecLimits, ServerCodec};
#[doc(inline)]
pub use frame::{Frame, LocalResponse, RequestFrame, RequestHead, ResponseFrame, ResponseHead};
#[doc(inline)]
pub use headers::BodyKind;
