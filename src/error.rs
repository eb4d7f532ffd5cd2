use std::{io, str::Utf8Error, string::FromUtf8Error};

use quick_error::quick_error;

quick_error! {
  /// All the ways compiling or querying a silo can fail.
  #[derive(Debug)]
  pub enum Error {
    InvalidData(msg: String) {
      display("invalid data: {}", msg)
    }
    NotSupported(msg: String) {
      display("not supported: {}", msg)
    }
    NotFound(msg: String) {
      display("not found: {}", msg)
    }
    InvalidArgument(msg: String) {
      display("invalid argument: {}", msg)
    }
    Cancelled {
      display("operation was cancelled")
    }
    Io(err: io::Error) {
      display("I/O error: {}", err)
    }
    Read(err: quick_xml::Error) {
      display("error while reading XML: {}", err)
    }
    Attr(err: quick_xml::events::attributes::AttrError) {
      display("attributes error: {}", err)
    }
    Utf8(err: Utf8Error) {
      display("utf8 error, valid up to {}", err.valid_up_to())
    }
    FromUtf8(err: FromUtf8Error) {
      display("utf8 error: {}", err)
    }
  }
}

pub type Result<T> = std::result::Result<T, Error>;
