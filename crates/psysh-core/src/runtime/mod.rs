//! Host runtime: the interpreter the shell evaluates input with, and the
//! patchable program image it runs against.

mod builtins;
mod function;
mod image;
mod interp;
mod ops;

pub use function::UserFunction;
pub use image::{
    ClassDef, PropertyDef, RuntimeImage, builtin_constant, builtin_parent, is_builtin_throwable,
};
pub use interp::{Interpreter, MAX_CALL_DEPTH};
