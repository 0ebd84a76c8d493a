use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// ErrChannelNumberOutOfRange indicates a channel number outside
    /// 0x4000..=0x7FFF.
    #[error("channel number not in [0x4000, 0x7FFF]")]
    ErrChannelNumberOutOfRange,

    /// ErrBadChannelDataLength indicates a ChannelData frame whose
    /// length field disagrees with the buffer.
    #[error("invalid ChannelData length")]
    ErrBadChannelDataLength,

    #[error("unexpected EOF while decoding ChannelData")]
    ErrUnexpectedEof,

    /// ErrAllocateAlreadyExists indicates a second Allocate on the
    /// same five-tuple (replies 437 on the wire).
    #[error("allocation already exists for this five-tuple")]
    ErrAllocateAlreadyExists,

    /// ErrNoAllocationFound indicates a request for a five-tuple the
    /// server does not know.
    #[error("no allocation found")]
    ErrNoAllocationFound,

    /// ErrSameChannelDifferentPeer indicates a ChannelBind that would
    /// rebind an existing channel or peer.
    #[error("channel or peer already bound differently")]
    ErrSameChannelDifferentPeer,

    /// ErrNoPermission indicates relayed traffic for a peer without a
    /// permission installed.
    #[error("no permission for peer address")]
    ErrNoPermission,

    /// ErrAllocationClosed indicates an operation on a closed
    /// allocation.
    #[error("allocation is closed")]
    ErrAllocationClosed,

    /// ErrUnsupportedTransport indicates REQUESTED-TRANSPORT other
    /// than UDP (replies 442 on the wire).
    #[error("unsupported requested transport protocol")]
    ErrUnsupportedTransport,

    /// ErrTransactionTimeout indicates no response arrived for a
    /// client request.
    #[error("transaction timed out")]
    ErrTransactionTimeout,

    /// ErrTransactionClosed indicates the client shut down while a
    /// request was in flight.
    #[error("transaction closed")]
    ErrTransactionClosed,

    /// ErrAllocationFailed carries the error code of a failed
    /// Allocate exchange.
    #[error("allocate error response: {0}")]
    ErrAllocationFailed(u16),

    /// ErrRequestFailed carries the error code of any other failed
    /// request.
    #[error("error response: {0}")]
    ErrRequestFailed(u16),

    /// ErrUnexpectedResponse indicates a response that matched a
    /// transaction but carried the wrong method.
    #[error("unexpected response type")]
    ErrUnexpectedResponse,

    /// ErrMissingRealm indicates a 401 without the attributes needed
    /// to retry with credentials.
    #[error("401 without REALM/NONCE")]
    ErrMissingRealm,

    #[error("stun: {0}")]
    Stun(#[from] stun::Error),

    #[error("util: {0}")]
    Util(#[from] util::Error),

    #[error("{0}")]
    Other(String),
}
