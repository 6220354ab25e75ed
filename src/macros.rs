// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

/// Return `None` from an `-> Option<T>` context unless a boolean expression holds.
macro_rules! guard {
    ($e:expr) => {{
        if !$e {
            return None;
        }
    }};
}
