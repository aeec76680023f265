use crate::frame::RawFrame;

/// One of the two hardware receive buffers of a CAN controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RxBuffer {
    Rx0,
    Rx1,
}

impl RxBuffer {
    /// Buffers in the order they are drained
    pub const ALL: [Self; 2] = [Self::Rx0, Self::Rx1];
}

/// Which receive buffers currently hold an unread frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RxFlags {
    pub rx0: bool,
    pub rx1: bool,
}

impl RxFlags {
    pub fn contains(&self, buffer: RxBuffer) -> bool {
        match buffer {
            RxBuffer::Rx0 => self.rx0,
            RxBuffer::Rx1 => self.rx1,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.rx0 && !self.rx1
    }

    /// Pending buffers, buffer 0 first
    pub fn pending(self) -> impl Iterator<Item = RxBuffer> {
        RxBuffer::ALL
            .into_iter()
            .filter(move |buffer| self.contains(*buffer))
    }
}

/// Receive overflow conditions latched by the controller. Until they are
/// cleared the affected buffer drops every new frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ErrorFlags {
    pub rx0_overflow: bool,
    pub rx1_overflow: bool,
}

impl ErrorFlags {
    pub fn has_overflow(&self) -> bool {
        self.rx0_overflow || self.rx1_overflow
    }
}

/// Register-level access to a CAN controller with two receive buffers.
///
/// This is the only surface the telemetry node needs from the hardware, so
/// supporting another controller chip means implementing these five calls.
pub trait CanController {
    type Error;

    /// Non-blocking check of the receive-full flags.
    fn poll_receive_flags(&mut self) -> Result<RxFlags, Self::Error>;

    /// Reads the frame held in `buffer`. Payload bytes past the DLC are zero.
    fn read_frame(&mut self, buffer: RxBuffer) -> Result<RawFrame, Self::Error>;

    /// Releases `buffer` for the next frame. Must follow every read or the
    /// controller never signals that buffer again.
    fn clear_receive_flag(&mut self, buffer: RxBuffer) -> Result<(), Self::Error>;

    fn error_flags(&mut self) -> Result<ErrorFlags, Self::Error>;

    /// Clears the overflow bits set in `flags`.
    fn clear_overflow(&mut self, flags: ErrorFlags) -> Result<(), Self::Error>;
}

impl<T> CanController for &mut T
where
    T: CanController,
{
    type Error = T::Error;

    fn poll_receive_flags(&mut self) -> Result<RxFlags, Self::Error> {
        (*self).poll_receive_flags()
    }

    fn read_frame(&mut self, buffer: RxBuffer) -> Result<RawFrame, Self::Error> {
        (*self).read_frame(buffer)
    }

    fn clear_receive_flag(&mut self, buffer: RxBuffer) -> Result<(), Self::Error> {
        (*self).clear_receive_flag(buffer)
    }

    fn error_flags(&mut self) -> Result<ErrorFlags, Self::Error> {
        (*self).error_flags()
    }

    fn clear_overflow(&mut self, flags: ErrorFlags) -> Result<(), Self::Error> {
        (*self).clear_overflow(flags)
    }
}

#[cfg(test)]
mod tests {
    use heapless::Vec;

    use super::*;

    #[test]
    fn pending_buffers_drain_in_order() {
        let both = RxFlags {
            rx0: true,
            rx1: true,
        };
        let order: Vec<RxBuffer, 2> = both.pending().collect();
        assert_eq!(order, [RxBuffer::Rx0, RxBuffer::Rx1]);

        let second = RxFlags {
            rx0: false,
            rx1: true,
        };
        let order: Vec<RxBuffer, 2> = second.pending().collect();
        assert_eq!(order, [RxBuffer::Rx1]);

        assert!(RxFlags::default().is_empty());
        assert_eq!(RxFlags::default().pending().count(), 0);
    }

    #[test]
    fn overflow_detection() {
        assert!(!ErrorFlags::default().has_overflow());
        assert!(ErrorFlags {
            rx0_overflow: false,
            rx1_overflow: true,
        }
        .has_overflow());
    }
}
