// BtCrab - GPL-3.0-or-later
// This file is part of BtCrab.
//
// Copyright (C) 2025 Daniel Freiermuth
//
// BtCrab is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// BtCrab is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with BtCrab.  If not, see <https://www.gnu.org/licenses/>.

//! Immutable code → name tables for the HCI, L2CAP, ATT and SMP layers.
//!
//! New codes are added here as data; the interpreter never branches on names.

use std::collections::HashMap;
use std::sync::LazyLock;

pub const OP_READ_BD_ADDR: u16 = 0x1009;
pub const OP_LE_START_ENCRYPTION: u16 = 0x2019;
pub const OP_LE_LTK_REQUEST_REPLY: u16 = 0x201A;

pub const EVT_DISCONNECT_COMPLETE: u8 = 0x05;
pub const EVT_COMMAND_COMPLETE: u8 = 0x0E;
pub const EVT_COMMAND_STATUS: u8 = 0x0F;
pub const EVT_LE_META: u8 = 0x3E;

pub const LE_CONNECTION_COMPLETE: u8 = 0x01;
pub const LE_ENHANCED_CONNECTION_COMPLETE: u8 = 0x0A;

pub const CID_ATT: u16 = 0x0004;
pub const CID_SMP: u16 = 0x0006;

pub const SMP_ENCRYPTION_INFO: u8 = 0x06;
pub const SMP_IDENTITY_INFO: u8 = 0x08;

fn table<K: std::hash::Hash + Eq + Copy>(entries: &[(K, &'static str)]) -> HashMap<K, &'static str> {
    entries.iter().copied().collect()
}

static HCI_COMMANDS: LazyLock<HashMap<u16, &'static str>> = LazyLock::new(|| {
    table(&[
        (0x0406, "Disconnect"),
        (0x0C01, "Set Event Mask"),
        (0x0C03, "Reset"),
        (0x0C13, "Write Local Name"),
        (0x0C14, "Read Local Name"),
        (0x0C6D, "Write LE Host Supported"),
        (0x1001, "Read Local Version Information"),
        (0x1002, "Read Local Supported Commands"),
        (0x1003, "Read Local Supported Features"),
        (0x1005, "Read Buffer Size"),
        (OP_READ_BD_ADDR, "Read BD_ADDR"),
        (0x2001, "LE Set Event Mask"),
        (0x2002, "LE Read Buffer Size"),
        (0x2003, "LE Read Local Supported Features"),
        (0x2005, "LE Set Random Address"),
        (0x2006, "LE Set Advertising Parameters"),
        (0x2008, "LE Set Advertising Data"),
        (0x2009, "LE Set Scan Response Data"),
        (0x200A, "LE Set Advertising Enable"),
        (0x200B, "LE Set Scan Parameters"),
        (0x200C, "LE Set Scan Enable"),
        (0x200D, "LE Create Connection"),
        (0x200E, "LE Create Connection Cancel"),
        (0x2011, "LE Add Device To Filter Accept List"),
        (0x2013, "LE Connection Update"),
        (0x2016, "LE Read Remote Features"),
        (0x2018, "LE Rand"),
        (OP_LE_START_ENCRYPTION, "LE Start Encryption"),
        (OP_LE_LTK_REQUEST_REPLY, "LE Long Term Key Request Reply"),
        (0x201B, "LE Long Term Key Request Negative Reply"),
        (0x2022, "LE Set Data Length"),
        (0x2027, "LE Add Device To Resolving List"),
        (0x2029, "LE Clear Resolving List"),
        (0x202D, "LE Set Address Resolution Enable"),
        (0x2031, "LE Set Default PHY"),
        (0x2032, "LE Set PHY"),
        (0x2036, "LE Set Extended Advertising Parameters"),
        (0x2039, "LE Set Extended Advertising Enable"),
        (0x2041, "LE Set Extended Scan Parameters"),
        (0x2042, "LE Set Extended Scan Enable"),
        (0x2043, "LE Extended Create Connection"),
    ])
});

static HCI_EVENTS: LazyLock<HashMap<u8, &'static str>> = LazyLock::new(|| {
    table(&[
        (EVT_DISCONNECT_COMPLETE, "Disconnect Complete"),
        (0x08, "Encryption Change"),
        (EVT_COMMAND_COMPLETE, "Command Complete"),
        (EVT_COMMAND_STATUS, "Command Status"),
        (0x10, "Hardware Error"),
        (0x13, "Number Of Completed Packets"),
        (0x30, "Encryption Key Refresh Complete"),
        (EVT_LE_META, "LE Meta Event"),
        (0xFF, "Vendor Specific"),
    ])
});

static LE_META_EVENTS: LazyLock<HashMap<u8, &'static str>> = LazyLock::new(|| {
    table(&[
        (LE_CONNECTION_COMPLETE, "LE Connection Complete"),
        (0x02, "LE Advertising Report"),
        (0x03, "LE Connection Update Complete"),
        (0x04, "LE Read Remote Features Complete"),
        (0x05, "LE Long Term Key Request"),
        (0x07, "LE Data Length Change"),
        (LE_ENHANCED_CONNECTION_COMPLETE, "LE Enhanced Connection Complete"),
        (0x0B, "LE Connection Update Complete"),
        (0x0C, "LE PHY Update Complete"),
        (0x0D, "LE Extended Advertising Report"),
    ])
});

static L2CAP_CIDS: LazyLock<HashMap<u16, &'static str>> = LazyLock::new(|| {
    table(&[
        (CID_ATT, "ATT"),
        (0x0005, "LE Signaling"),
        (CID_SMP, "SMP"),
    ])
});

static ATT_OPCODES: LazyLock<HashMap<u8, &'static str>> = LazyLock::new(|| {
    table(&[
        (0x01, "Error Rsp"),
        (0x02, "Exchange MTU Req"),
        (0x03, "Exchange MTU Rsp"),
        (0x04, "Find Info Req"),
        (0x05, "Find Info Rsp"),
        (0x08, "Read By Type Req"),
        (0x09, "Read By Type Rsp"),
        (0x0A, "Read Req"),
        (0x0B, "Read Rsp"),
        (0x0C, "Read Blob Req"),
        (0x0D, "Read Blob Rsp"),
        (0x10, "Read By Group Type Req"),
        (0x11, "Read By Group Type Rsp"),
        (0x12, "Write Req"),
        (0x13, "Write Rsp"),
        (0x52, "Write Cmd"),
        (0x1B, "Notification"),
        (0x1D, "Indication"),
        (0x1E, "Confirmation"),
    ])
});

static SMP_CODES: LazyLock<HashMap<u8, &'static str>> = LazyLock::new(|| {
    table(&[
        (0x01, "Pairing Req"),
        (0x02, "Pairing Rsp"),
        (0x03, "Pairing Confirm"),
        (0x04, "Pairing Random"),
        (0x05, "Pairing Failed"),
        (SMP_ENCRYPTION_INFO, "Encryption Info (LTK)"),
        (0x07, "Master Identification"),
        (SMP_IDENTITY_INFO, "Identity Info (IRK)"),
        (0x09, "Identity Address Info"),
        (0x0A, "Signing Info"),
        (0x0B, "Security Req"),
        (0x0C, "Pairing Public Key"),
        (0x0D, "Pairing DHKey Check"),
    ])
});

static DISCONNECT_REASONS: LazyLock<HashMap<u8, &'static str>> = LazyLock::new(|| {
    table(&[
        (0x00, "Success"),
        (0x01, "Unknown HCI Command"),
        (0x02, "Unknown Connection Identifier"),
        (0x03, "Hardware Failure"),
        (0x04, "Page Timeout"),
        (0x05, "Authentication Failure"),
        (0x06, "PIN or Key Missing"),
        (0x07, "Memory Capacity Exceeded"),
        (0x08, "Connection Timeout"),
        (0x09, "Connection Limit Exceeded"),
        (0x0A, "Synchronous Connection Limit Exceeded"),
        (0x0B, "Connection Already Exists"),
        (0x0C, "Command Disallowed"),
        (0x0D, "Connection Rejected (Limited Resources)"),
        (0x0E, "Connection Rejected (Security)"),
        (0x0F, "Connection Rejected (Unacceptable BD_ADDR)"),
        (0x10, "Connection Accept Timeout"),
        (0x11, "Unsupported Feature or Parameter"),
        (0x12, "Invalid HCI Command Parameters"),
        (0x13, "Remote User Terminated Connection"),
        (0x14, "Remote Device Terminated (Low Resources)"),
        (0x15, "Remote Device Terminated (Power Off)"),
        (0x16, "Connection Terminated by Local Host"),
        (0x17, "Repeated Attempts"),
        (0x18, "Pairing Not Allowed"),
        (0x19, "Unknown LMP PDU"),
        (0x1A, "Unsupported Remote/LMP Feature"),
        (0x1B, "SCO Offset Rejected"),
        (0x1C, "SCO Interval Rejected"),
        (0x1D, "SCO Air Mode Rejected"),
        (0x1E, "Invalid LMP/LL Parameters"),
        (0x1F, "Unspecified Error"),
        (0x20, "Unsupported LMP/LL Parameter"),
        (0x21, "Role Change Not Allowed"),
        (0x22, "LMP/LL Response Timeout"),
        (0x23, "LMP/LL Error Transaction Collision"),
        (0x24, "LMP PDU Not Allowed"),
        (0x25, "Encryption Mode Not Acceptable"),
        (0x26, "Link Key Cannot Be Changed"),
        (0x27, "Requested QoS Not Supported"),
        (0x28, "Instant Passed"),
        (0x29, "Pairing with Unit Key Not Supported"),
        (0x2A, "Different Transaction Collision"),
        (0x2E, "QoS Unacceptable Parameter"),
        (0x2F, "QoS Rejected"),
        (0x30, "Channel Assessment Not Supported"),
        (0x31, "Insufficient Security"),
        (0x32, "Parameter Out of Mandatory Range"),
        (0x34, "Role Switch Pending"),
        (0x36, "Reserved Slot Violation"),
        (0x37, "Role Switch Failed"),
        (0x38, "Extended Inquiry Response Too Large"),
        (0x39, "Secure Simple Pairing Not Supported"),
        (0x3A, "Host Busy - Pairing"),
        (0x3B, "Connection Rejected (No Suitable Channel)"),
        (0x3C, "Controller Busy"),
        (0x3D, "Unacceptable Connection Parameters"),
        (0x3E, "Advertising Timeout"),
        (0x3F, "Connection Terminated (MIC Failure)"),
        (0x40, "Connection Failed to be Established"),
        (0x41, "MAC Connection Failed"),
        (0x42, "Coarse Clock Adjustment Rejected"),
    ])
});

pub fn command_name(opcode: u16) -> Option<&'static str> {
    HCI_COMMANDS.get(&opcode).copied()
}

/// Name of a command for summaries; unknown opcodes render as `Unknown OpCode: 0xNNNN`
pub fn command_label(opcode: u16) -> String {
    command_name(opcode).map_or_else(|| format!("Unknown OpCode: 0x{opcode:04x}"), str::to_string)
}

pub fn event_name(code: u8) -> Option<&'static str> {
    HCI_EVENTS.get(&code).copied()
}

pub fn le_meta_name(sub_event: u8) -> Option<&'static str> {
    LE_META_EVENTS.get(&sub_event).copied()
}

/// Channel label, falling back to the hex CID
pub fn cid_label(cid: u16) -> String {
    L2CAP_CIDS
        .get(&cid)
        .map_or_else(|| format!("0x{cid:x}"), |name| (*name).to_string())
}

pub fn att_label(opcode: u8) -> String {
    ATT_OPCODES
        .get(&opcode)
        .map_or_else(|| format!("Op {opcode:x}"), |name| (*name).to_string())
}

pub fn smp_label(code: u8) -> String {
    SMP_CODES
        .get(&code)
        .map_or_else(|| format!("Code {code:x}"), |name| (*name).to_string())
}

pub fn disconnect_reason(reason: u8) -> String {
    DISCONNECT_REASONS
        .get(&reason)
        .map_or_else(|| format!("Unknown Reason (0x{reason:02x})"), |text| (*text).to_string())
}
