// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::mem::size_of;

use super::bits::{self, MsgFunction};

use thiserror::Error;
use zerocopy::FromBytes;

/// Errors that may be encountered during request parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseErr {
    /// The frame is shorter than the request layout for its function.
    #[error("{function:?} request truncated: {have} of {need} bytes")]
    Truncated { function: MsgFunction, need: usize, have: usize },

    /// The frame does not even hold a message header.
    #[error("frame shorter than message header")]
    NoHeader,
}

/// A decoded request message.
#[derive(Debug)]
pub enum MessageRequest {
    /// SCSI I/O, executed against one of the attached targets
    ScsiIo(bits::ScsiIoRequest),
    /// SCSI task management
    TaskMgmt(bits::TaskMgmtRequest),
    /// IOC init, moving the IOC to the Operational state
    IocInit(bits::IocInitRequest),
    /// IOC facts
    IocFacts(bits::PortRequest),
    /// Configuration page access
    Config(bits::ConfigRequest),
    /// Port facts
    PortFacts(bits::PortRequest),
    /// Port enable
    PortEnable(bits::PortRequest),
    /// Event notification on/off
    EventNotification(bits::EventNotificationRequest),
    /// Event acknowledge, not supported
    EventAck(bits::MsgHeader),
    /// Firmware download, not supported
    FwDownload(bits::MsgHeader),
    /// An unknown function
    Unknown(bits::MsgHeader),
}

impl MessageRequest {
    /// Size of the request frame for a given function, if one is known.
    ///
    /// Event ack and firmware download are recognized but unsupported, so
    /// they have no size either.
    pub fn request_size(function: u8) -> Option<usize> {
        let size = match MsgFunction::from_repr(function)? {
            MsgFunction::ScsiIo => size_of::<bits::ScsiIoRequest>(),
            MsgFunction::TaskMgmt => size_of::<bits::TaskMgmtRequest>(),
            MsgFunction::IocInit => size_of::<bits::IocInitRequest>(),
            MsgFunction::IocFacts
            | MsgFunction::PortFacts
            | MsgFunction::PortEnable => size_of::<bits::PortRequest>(),
            MsgFunction::Config => size_of::<bits::ConfigRequest>(),
            MsgFunction::EventNotification => {
                size_of::<bits::EventNotificationRequest>()
            }
            MsgFunction::EventAck | MsgFunction::FwDownload => return None,
        };
        Some(size)
    }

    /// Try to parse a `MessageRequest` out of the raw bytes of a frame.
    ///
    /// `buf` may be longer than the request; trailing bytes (such as an
    /// inline SGL) are ignored.
    pub fn parse(buf: &[u8]) -> Result<Self, ParseErr> {
        let (hdr, _) = bits::MsgHeader::read_from_prefix(buf)
            .map_err(|_| ParseErr::NoHeader)?;

        let function = match MsgFunction::from_repr(hdr.function) {
            Some(f) => f,
            None => return Ok(MessageRequest::Unknown(hdr)),
        };

        fn body<T: FromBytes>(
            function: MsgFunction,
            buf: &[u8],
        ) -> Result<T, ParseErr> {
            T::read_from_prefix(buf).map(|(v, _)| v).map_err(|_| {
                ParseErr::Truncated {
                    function,
                    need: size_of::<T>(),
                    have: buf.len(),
                }
            })
        }

        let req = match function {
            MsgFunction::ScsiIo => {
                MessageRequest::ScsiIo(body(function, buf)?)
            }
            MsgFunction::TaskMgmt => {
                MessageRequest::TaskMgmt(body(function, buf)?)
            }
            MsgFunction::IocInit => {
                MessageRequest::IocInit(body(function, buf)?)
            }
            MsgFunction::IocFacts => {
                MessageRequest::IocFacts(body(function, buf)?)
            }
            MsgFunction::Config => MessageRequest::Config(body(function, buf)?),
            MsgFunction::PortFacts => {
                MessageRequest::PortFacts(body(function, buf)?)
            }
            MsgFunction::PortEnable => {
                MessageRequest::PortEnable(body(function, buf)?)
            }
            MsgFunction::EventNotification => {
                MessageRequest::EventNotification(body(function, buf)?)
            }
            MsgFunction::EventAck => MessageRequest::EventAck(hdr),
            MsgFunction::FwDownload => MessageRequest::FwDownload(hdr),
        };
        Ok(req)
    }

    /// Raw function code of the request.
    pub fn function(&self) -> u8 {
        match self {
            MessageRequest::ScsiIo(r) => r.function,
            MessageRequest::TaskMgmt(r) => r.function,
            MessageRequest::IocInit(r) => r.function,
            MessageRequest::IocFacts(r)
            | MessageRequest::PortFacts(r)
            | MessageRequest::PortEnable(r) => r.function,
            MessageRequest::Config(r) => r.function,
            MessageRequest::EventNotification(r) => r.function,
            MessageRequest::EventAck(h)
            | MessageRequest::FwDownload(h)
            | MessageRequest::Unknown(h) => h.function,
        }
    }

    /// Context supplied by the host, to be echoed in the reply.
    pub fn msg_context(&self) -> u32 {
        match self {
            MessageRequest::ScsiIo(r) => r.msg_context.get(),
            MessageRequest::TaskMgmt(r) => r.msg_context.get(),
            MessageRequest::IocInit(r) => r.msg_context.get(),
            MessageRequest::IocFacts(r)
            | MessageRequest::PortFacts(r)
            | MessageRequest::PortEnable(r) => r.msg_context.get(),
            MessageRequest::Config(r) => r.msg_context.get(),
            MessageRequest::EventNotification(r) => r.msg_context.get(),
            MessageRequest::EventAck(h)
            | MessageRequest::FwDownload(h)
            | MessageRequest::Unknown(h) => h.msg_context.get(),
        }
    }
}
