//! Stream-json wire protocol: framing, envelopes, event translation, and
//! the control side channel.

pub mod codec;
pub mod control;
pub mod envelope;
pub mod translator;
