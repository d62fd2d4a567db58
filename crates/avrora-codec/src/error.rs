use thiserror::Error;

/// Errors raised while framing or deframing messages.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The configured frame size was zero.
    #[error("frame size must be positive")]
    ZeroFrameSize,

    /// The stream ended mid-message: inside a length prefix, inside a frame
    /// payload, or after payload frames with no zero-length terminator.
    #[error("unexpected end of stream")]
    UnexpectedEnd,

    /// The stream carried no message at all (strict-empty decoding).
    #[error("empty stream")]
    EmptyStream,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
