pub mod emitter;
pub mod helpers;
pub mod materializer;
pub mod round_trip;
