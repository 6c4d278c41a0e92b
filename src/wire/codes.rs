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

use num_derive::FromPrimitive;

/// Request codes sent client -> server, per the wire constants table.
#[repr(u16)]
#[derive(Copy, Clone, Eq, PartialEq, Debug, FromPrimitive)]
pub enum RequestCode {
    Register = 1025,
    PublishPublicKey = 1026,
    Reconnect = 1027,
    SendFile = 1028,
    CrcOk = 1029,
    CrcRetry = 1030,
    CrcFailed = 1031,
}

/// Response codes sent server -> client.
#[repr(u16)]
#[derive(Copy, Clone, Eq, PartialEq, Debug, FromPrimitive)]
pub enum ResponseCode {
    RegistrationSuccess = 1600,
    RegistrationFailed = 1601,
    PublicKeyAcceptedWithSessionKey = 1602,
    FileReceivedWithCrc = 1603,
    GenericAck = 1604,
    MalformedHeader = 1605,
    UnknownClientOrCode = 1606,
    GenericServerError = 1607,
}
