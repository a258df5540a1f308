mod common;
mod protocol;
mod runtime;
