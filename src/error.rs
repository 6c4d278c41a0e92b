/* This file is part of cryptobak.
 *
 * cryptobak is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of the
 * License, or (at your option) any later version.
 *
 * cryptobak is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with cryptobak.  If not, see <http://www.gnu.org/licenses/>.
 */

//! A closed failure taxonomy (spec §7) layered on top of `anyhow`: every
//! fallible call still returns `anyhow::Result`, but dispatch sites that
//! care *what kind* of failure occurred (to pick a log level, a response
//! code, or a retry policy) can recover it with [`kind_of`].

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Network,
    Protocol,
    Crypto,
    Storage,
    Integrity,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Config => "config",
            Self::Network => "network",
            Self::Protocol => "protocol",
            Self::Crypto => "crypto",
            Self::Storage => "storage",
            Self::Integrity => "integrity",
        };
        f.write_str(name)
    }
}

impl std::error::Error for ErrorKind {}

/// Walks an error's context chain looking for a tagged [`ErrorKind`].
/// Returns `None` for errors that were never classified (plain I/O errors
/// propagated with `?`, for instance).
pub fn kind_of(err: &anyhow::Error) -> Option<ErrorKind> {
    err.chain().find_map(|cause| cause.downcast_ref::<ErrorKind>().copied())
}

/// Builds an `anyhow::Error` tagged with an [`ErrorKind`], the way
/// `anyhow!` builds an untagged one.
#[macro_export]
macro_rules! proto_error {
    ($kind:expr, $($arg:tt)*) => {
        anyhow::Error::msg(format!($($arg)*)).context($kind)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_of_recovers_tagged_errors() {
        let err = proto_error!(ErrorKind::Integrity, "crc mismatch");
        assert_eq!(kind_of(&err), Some(ErrorKind::Integrity));
    }

    #[test]
    fn kind_of_is_none_for_untagged_errors() {
        let err = anyhow::anyhow!("plain failure");
        assert_eq!(kind_of(&err), None);
    }
}
