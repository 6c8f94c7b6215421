pub mod block;
pub mod usb;
