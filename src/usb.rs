// Based on USB 2.0 specifications
// https://www.usb.org/document-library/usb-20-specification
// especially chapter 8, protocol layer

pub mod byte;
pub mod packet;
pub mod protocol;
pub mod signal;
pub mod types;
