//! Positional argument lists for hub invocations.
//!
//! Arguments travel as a list of protocol-neutral [`serde_json::Value`]s.
//! Tuples of up to eight elements convert to and from such lists, so
//! `("user", 42)` can be passed to `send` and a handler may take `(String, i32)`.

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::error::{Result, SignalRError};

/// Decodes a positional argument list into typed values.
pub trait FromArguments: Sized {
    fn from_arguments(arguments: Vec<Value>) -> Result<Self>;
}

/// Encodes typed values into a positional argument list.
pub trait IntoArguments {
    fn into_arguments(self) -> Result<Vec<Value>>;
}

impl FromArguments for Vec<Value> {
    fn from_arguments(arguments: Vec<Value>) -> Result<Self> {
        Ok(arguments)
    }
}

impl IntoArguments for Vec<Value> {
    fn into_arguments(self) -> Result<Vec<Value>> {
        Ok(self)
    }
}

fn decode_argument<T: DeserializeOwned>(index: usize, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| SignalRError::ArgumentDecode {
        index,
        message: e.to_string(),
    })
}

macro_rules! tuple_arguments {
    ($count:expr; $($name:ident : $index:tt),*) => {
        impl<$($name: DeserializeOwned),*> FromArguments for ($($name,)*) {
            #[allow(unused_variables, unused_mut)]
            fn from_arguments(arguments: Vec<Value>) -> Result<Self> {
                if arguments.len() != $count {
                    return Err(SignalRError::ArgumentCount {
                        expected: $count,
                        actual: arguments.len(),
                    });
                }
                let mut values = arguments.into_iter();
                Ok(($(decode_argument::<$name>($index, values.next().unwrap_or_default())?,)*))
            }
        }

        impl<$($name: Serialize),*> IntoArguments for ($($name,)*) {
            #[allow(unused_variables)]
            fn into_arguments(self) -> Result<Vec<Value>> {
                Ok(vec![$(serde_json::to_value(&self.$index)?,)*])
            }
        }
    };
}

tuple_arguments!(0;);
tuple_arguments!(1; A: 0);
tuple_arguments!(2; A: 0, B: 1);
tuple_arguments!(3; A: 0, B: 1, C: 2);
tuple_arguments!(4; A: 0, B: 1, C: 2, D: 3);
tuple_arguments!(5; A: 0, B: 1, C: 2, D: 3, E: 4);
tuple_arguments!(6; A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);
tuple_arguments!(7; A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6);
tuple_arguments!(8; A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7);
