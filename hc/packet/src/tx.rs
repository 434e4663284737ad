//! Transmit path

use hc_core::HcError;

use crate::frame::Frame;

/// Byte transmitter accepting one contiguous buffer at a time
///
/// `WouldBlock` means the transmitter is busy and the same buffer should be
/// offered again later; nothing was sent.
pub trait ByteSink {
    type Error: core::fmt::Debug;

    fn transmit(&mut self, data: &[u8]) -> nb::Result<(), Self::Error>;
}

/// Hand an already encoded frame to the sink
pub fn send_frame<S: ByteSink + ?Sized>(sink: &mut S, frame: &Frame) -> nb::Result<(), HcError> {
    sink.transmit(frame.as_bytes()).map_err(|err| match err {
        nb::Error::WouldBlock => nb::Error::WouldBlock,
        nb::Error::Other(_err) => {
            warn!("transmit of {} byte frame failed", frame.len());
            nb::Error::Other(HcError::TransmitFailed)
        }
    })
}

/// Encode `payload` and hand the frame to the sink
///
/// Retrying after `WouldBlock` encodes again; keep the [`Frame`] and use
/// [`send_frame`] to avoid that.
pub fn send<S: ByteSink + ?Sized>(sink: &mut S, payload: &[u8]) -> nb::Result<(), HcError> {
    let frame = Frame::new(payload).map_err(nb::Error::Other)?;
    send_frame(sink, &frame)
}
