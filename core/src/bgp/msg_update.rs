// Copyright 2025 rbgp Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use super::msg::{Message, MessageType};
use super::msg_notification::UpdateMessageError;
use super::utils::{is_valid_unicast_ipv4, parse_nlri_list, read_u32, write_nlri_list, ParserError};
use crate::net::Ipv4Net;
use std::collections::HashSet;
use std::net::Ipv4Addr;

const WITHDRAWN_ROUTES_LENGTH_SIZE: usize = 2;
const TOTAL_ATTR_LENGTH_SIZE: usize = 2;

pub struct PathAttrFlag;

impl PathAttrFlag {
    pub const OPTIONAL: u8 = 1 << 7;
    pub const TRANSITIVE: u8 = 1 << 6;
    pub const PARTIAL: u8 = 1 << 5;
    pub const EXTENDED_LENGTH: u8 = 1 << 4;
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrType {
    Origin = 1,
    AsPath = 2,
    NextHop = 3,
    MultiExitDisc = 4,
    LocalPref = 5,
    AtomicAggregate = 6,
    Aggregator = 7,
    OriginatorId = 9,
    ClusterList = 10,
}

impl AttrType {
    fn from_code(value: u8) -> Option<Self> {
        match value {
            1 => Some(AttrType::Origin),
            2 => Some(AttrType::AsPath),
            3 => Some(AttrType::NextHop),
            4 => Some(AttrType::MultiExitDisc),
            5 => Some(AttrType::LocalPref),
            6 => Some(AttrType::AtomicAggregate),
            7 => Some(AttrType::Aggregator),
            9 => Some(AttrType::OriginatorId),
            10 => Some(AttrType::ClusterList),
            _ => None,
        }
    }

    /// Optional and Transitive bits every sender must set for this type.
    fn expected_flags(&self) -> u8 {
        match self {
            AttrType::Origin
            | AttrType::AsPath
            | AttrType::NextHop
            | AttrType::LocalPref
            | AttrType::AtomicAggregate => PathAttrFlag::TRANSITIVE,
            AttrType::MultiExitDisc | AttrType::OriginatorId | AttrType::ClusterList => {
                PathAttrFlag::OPTIONAL
            }
            AttrType::Aggregator => PathAttrFlag::OPTIONAL | PathAttrFlag::TRANSITIVE,
        }
    }

    fn is_well_known(&self) -> bool {
        self.expected_flags() & PathAttrFlag::OPTIONAL == 0
    }

    fn valid_length(&self, len: usize) -> bool {
        match self {
            AttrType::Origin => len == 1,
            AttrType::NextHop
            | AttrType::MultiExitDisc
            | AttrType::LocalPref
            | AttrType::OriginatorId => len == 4,
            AttrType::AtomicAggregate => len == 0,
            AttrType::Aggregator => len == 6,
            AttrType::ClusterList => len % 4 == 0,
            AttrType::AsPath => true,
        }
    }
}

/// ORIGIN values. Declaration order is the preference order.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub enum Origin {
    IGP = 0,
    EGP = 1,
    INCOMPLETE = 2,
}

impl TryFrom<u8> for Origin {
    type Error = ParserError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Origin::IGP),
            1 => Ok(Origin::EGP),
            2 => Ok(Origin::INCOMPLETE),
            _ => Err(ParserError::update(
                UpdateMessageError::InvalidOriginAttribute,
                vec![PathAttrFlag::TRANSITIVE, AttrType::Origin as u8, 1, value],
            )),
        }
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Origin::IGP => write!(f, "igp"),
            Origin::EGP => write!(f, "egp"),
            Origin::INCOMPLETE => write!(f, "incomplete"),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum AsPathSegmentType {
    AsSet = 1,
    AsSequence = 2,
}

#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub struct AsPathSegment {
    pub segment_type: AsPathSegmentType,
    pub asn_list: Vec<u16>,
}

impl AsPathSegment {
    pub fn sequence(asn_list: Vec<u16>) -> Self {
        AsPathSegment {
            segment_type: AsPathSegmentType::AsSequence,
            asn_list,
        }
    }

    pub fn set(asn_list: Vec<u16>) -> Self {
        AsPathSegment {
            segment_type: AsPathSegmentType::AsSet,
            asn_list,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathAttrValue {
    Origin(Origin),
    AsPath(Vec<AsPathSegment>),
    NextHop(Ipv4Addr),
    MultiExitDisc(u32),
    LocalPref(u32),
    AtomicAggregate,
    Aggregator { asn: u16, address: Ipv4Addr },
    OriginatorId(Ipv4Addr),
    ClusterList(Vec<Ipv4Addr>),
    /// Optional attribute this speaker does not interpret.
    Unknown { type_code: u8, value: Vec<u8> },
}

impl PathAttrValue {
    pub fn type_code(&self) -> u8 {
        match self {
            PathAttrValue::Origin(_) => AttrType::Origin as u8,
            PathAttrValue::AsPath(_) => AttrType::AsPath as u8,
            PathAttrValue::NextHop(_) => AttrType::NextHop as u8,
            PathAttrValue::MultiExitDisc(_) => AttrType::MultiExitDisc as u8,
            PathAttrValue::LocalPref(_) => AttrType::LocalPref as u8,
            PathAttrValue::AtomicAggregate => AttrType::AtomicAggregate as u8,
            PathAttrValue::Aggregator { .. } => AttrType::Aggregator as u8,
            PathAttrValue::OriginatorId(_) => AttrType::OriginatorId as u8,
            PathAttrValue::ClusterList(_) => AttrType::ClusterList as u8,
            PathAttrValue::Unknown { type_code, .. } => *type_code,
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        match self {
            PathAttrValue::Origin(origin) => vec![*origin as u8],
            PathAttrValue::AsPath(segments) => {
                let mut bytes = Vec::new();
                for segment in segments {
                    bytes.push(segment.segment_type as u8);
                    bytes.push(segment.asn_list.len() as u8);
                    for asn in &segment.asn_list {
                        bytes.extend_from_slice(&asn.to_be_bytes());
                    }
                }
                bytes
            }
            PathAttrValue::NextHop(addr) => addr.octets().to_vec(),
            PathAttrValue::MultiExitDisc(value) | PathAttrValue::LocalPref(value) => {
                value.to_be_bytes().to_vec()
            }
            PathAttrValue::AtomicAggregate => vec![],
            PathAttrValue::Aggregator { asn, address } => {
                let mut bytes = asn.to_be_bytes().to_vec();
                bytes.extend_from_slice(&address.octets());
                bytes
            }
            PathAttrValue::OriginatorId(addr) => addr.octets().to_vec(),
            PathAttrValue::ClusterList(ids) => ids.iter().flat_map(|id| id.octets()).collect(),
            PathAttrValue::Unknown { value, .. } => value.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathAttribute {
    pub flags: u8,
    pub value: PathAttrValue,
}

impl PathAttribute {
    /// Build an attribute carrying the standard flags for its type.
    pub fn new(value: PathAttrValue) -> Self {
        let flags = AttrType::from_code(value.type_code())
            .map(|t| t.expected_flags())
            .unwrap_or(PathAttrFlag::OPTIONAL | PathAttrFlag::TRANSITIVE);
        PathAttribute { flags, value }
    }

    pub fn is_transitive(&self) -> bool {
        self.flags & PathAttrFlag::TRANSITIVE != 0
    }

    fn to_bytes(&self) -> Vec<u8> {
        let value = self.value.to_bytes();
        let mut bytes = Vec::with_capacity(value.len() + 4);

        if value.len() > u8::MAX as usize {
            bytes.push(self.flags | PathAttrFlag::EXTENDED_LENGTH);
            bytes.push(self.value.type_code());
            bytes.extend_from_slice(&(value.len() as u16).to_be_bytes());
        } else {
            bytes.push(self.flags & !PathAttrFlag::EXTENDED_LENGTH);
            bytes.push(self.value.type_code());
            bytes.push(value.len() as u8);
        }
        bytes.extend_from_slice(&value);
        bytes
    }
}

fn read_attr_as_path(bytes: &[u8]) -> Result<Vec<AsPathSegment>, ParserError> {
    let malformed = || ParserError::update(UpdateMessageError::MalformedASPath, Vec::new());
    let mut segments = vec![];
    let mut cursor = 0;

    while cursor < bytes.len() {
        if cursor + 2 > bytes.len() {
            return Err(malformed());
        }
        let segment_type = match bytes[cursor] {
            1 => AsPathSegmentType::AsSet,
            2 => AsPathSegmentType::AsSequence,
            _ => return Err(malformed()),
        };
        let segment_len = bytes[cursor + 1] as usize;
        if segment_len == 0 {
            return Err(malformed());
        }

        let segment_size = 2 + segment_len * 2;
        if cursor + segment_size > bytes.len() {
            return Err(malformed());
        }

        let asn_list = bytes[cursor + 2..cursor + segment_size]
            .chunks_exact(2)
            .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
            .collect();

        segments.push(AsPathSegment {
            segment_type,
            asn_list,
        });

        cursor += segment_size;
    }

    Ok(segments)
}

fn read_ipv4(bytes: &[u8]) -> Ipv4Addr {
    Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3])
}

/// Parse one attribute and return it with the number of bytes consumed.
fn read_path_attribute(bytes: &[u8]) -> Result<(PathAttribute, usize), ParserError> {
    let malformed =
        || ParserError::update(UpdateMessageError::MalformedAttributeList, Vec::new());
    if bytes.len() < 3 {
        return Err(malformed());
    }

    let flags = bytes[0];
    let type_code = bytes[1];
    let extended = flags & PathAttrFlag::EXTENDED_LENGTH != 0;

    let (attr_len, offset) = if extended {
        if bytes.len() < 4 {
            return Err(malformed());
        }
        (u16::from_be_bytes([bytes[2], bytes[3]]) as usize, 4)
    } else {
        (bytes[2] as usize, 3)
    };

    let total_len = offset + attr_len;
    if total_len > bytes.len() {
        return Err(ParserError::update(
            UpdateMessageError::AttributeLengthError,
            bytes.to_vec(),
        ));
    }
    let attr_bytes = &bytes[..total_len];
    let data = &bytes[offset..total_len];

    let Some(attr_type) = AttrType::from_code(type_code) else {
        if flags & PathAttrFlag::OPTIONAL == 0 {
            return Err(ParserError::update(
                UpdateMessageError::UnrecognizedWellKnownAttribute,
                attr_bytes.to_vec(),
            ));
        }
        let attribute = PathAttribute {
            flags: flags & !PathAttrFlag::EXTENDED_LENGTH,
            value: PathAttrValue::Unknown {
                type_code,
                value: data.to_vec(),
            },
        };
        return Ok((attribute, total_len));
    };

    let mask = PathAttrFlag::OPTIONAL | PathAttrFlag::TRANSITIVE;
    if (flags & mask) != attr_type.expected_flags()
        || (attr_type.is_well_known() && flags & PathAttrFlag::PARTIAL != 0)
    {
        return Err(ParserError::update(
            UpdateMessageError::AttributeFlagsError,
            attr_bytes.to_vec(),
        ));
    }

    if !attr_type.valid_length(attr_len) {
        return Err(ParserError::update(
            UpdateMessageError::AttributeLengthError,
            attr_bytes.to_vec(),
        ));
    }

    let value = match attr_type {
        AttrType::Origin => PathAttrValue::Origin(Origin::try_from(data[0])?),
        AttrType::AsPath => PathAttrValue::AsPath(read_attr_as_path(data)?),
        AttrType::NextHop => {
            let next_hop = read_u32(data)?;
            if !is_valid_unicast_ipv4(next_hop) {
                return Err(ParserError::update(
                    UpdateMessageError::InvalidNextHopAttribute,
                    attr_bytes.to_vec(),
                ));
            }
            PathAttrValue::NextHop(Ipv4Addr::from(next_hop))
        }
        AttrType::MultiExitDisc => PathAttrValue::MultiExitDisc(read_u32(data)?),
        AttrType::LocalPref => PathAttrValue::LocalPref(read_u32(data)?),
        AttrType::AtomicAggregate => PathAttrValue::AtomicAggregate,
        AttrType::Aggregator => PathAttrValue::Aggregator {
            asn: u16::from_be_bytes([data[0], data[1]]),
            address: read_ipv4(&data[2..6]),
        },
        AttrType::OriginatorId => PathAttrValue::OriginatorId(read_ipv4(data)),
        AttrType::ClusterList => {
            PathAttrValue::ClusterList(data.chunks_exact(4).map(read_ipv4).collect())
        }
    };

    let attribute = PathAttribute {
        flags: flags & !PathAttrFlag::EXTENDED_LENGTH,
        value,
    };
    Ok((attribute, total_len))
}

fn read_path_attributes(bytes: &[u8]) -> Result<Vec<PathAttribute>, ParserError> {
    let mut cursor = 0;
    let mut seen = HashSet::new();
    let mut path_attributes: Vec<PathAttribute> = Vec::new();

    while cursor < bytes.len() {
        let (attribute, consumed) = read_path_attribute(&bytes[cursor..])?;
        cursor += consumed;

        // Each attribute type may appear at most once
        if !seen.insert(attribute.value.type_code()) {
            return Err(ParserError::update(
                UpdateMessageError::MalformedAttributeList,
                Vec::new(),
            ));
        }

        path_attributes.push(attribute);
    }

    Ok(path_attributes)
}

fn write_path_attributes(path_attributes: &[PathAttribute]) -> Vec<u8> {
    path_attributes
        .iter()
        .flat_map(|attr| attr.to_bytes())
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateMessage {
    withdrawn_routes: Vec<Ipv4Net>,
    path_attributes: Vec<PathAttribute>,
    nlri_list: Vec<Ipv4Net>,
}

impl UpdateMessage {
    pub fn new(path_attributes: Vec<PathAttribute>, nlri_list: Vec<Ipv4Net>) -> Self {
        UpdateMessage {
            withdrawn_routes: vec![],
            path_attributes,
            nlri_list,
        }
    }

    pub fn new_withdraw(withdrawn_routes: Vec<Ipv4Net>) -> Self {
        UpdateMessage {
            withdrawn_routes,
            path_attributes: vec![],
            nlri_list: vec![],
        }
    }

    pub fn nlri_list(&self) -> &[Ipv4Net] {
        &self.nlri_list
    }

    pub fn withdrawn_routes(&self) -> &[Ipv4Net] {
        &self.withdrawn_routes
    }

    pub fn path_attributes(&self) -> &[PathAttribute] {
        &self.path_attributes
    }

    /// An UPDATE carrying nothing marks End-of-RIB.
    pub fn is_end_of_rib(&self) -> bool {
        self.withdrawn_routes.is_empty()
            && self.path_attributes.is_empty()
            && self.nlri_list.is_empty()
    }

    fn find<T>(&self, f: impl Fn(&PathAttrValue) -> Option<T>) -> Option<T> {
        self.path_attributes.iter().find_map(|attr| f(&attr.value))
    }

    pub fn get_origin(&self) -> Option<Origin> {
        self.find(|v| match v {
            PathAttrValue::Origin(origin) => Some(*origin),
            _ => None,
        })
    }

    pub fn get_as_path(&self) -> Option<Vec<AsPathSegment>> {
        self.find(|v| match v {
            PathAttrValue::AsPath(segments) => Some(segments.clone()),
            _ => None,
        })
    }

    pub fn get_next_hop(&self) -> Option<Ipv4Addr> {
        self.find(|v| match v {
            PathAttrValue::NextHop(addr) => Some(*addr),
            _ => None,
        })
    }

    pub fn get_local_pref(&self) -> Option<u32> {
        self.find(|v| match v {
            PathAttrValue::LocalPref(pref) => Some(*pref),
            _ => None,
        })
    }

    pub fn get_med(&self) -> Option<u32> {
        self.find(|v| match v {
            PathAttrValue::MultiExitDisc(med) => Some(*med),
            _ => None,
        })
    }

    pub fn get_atomic_aggregate(&self) -> bool {
        self.path_attributes
            .iter()
            .any(|attr| attr.value == PathAttrValue::AtomicAggregate)
    }

    pub fn get_aggregator(&self) -> Option<(u16, Ipv4Addr)> {
        self.find(|v| match v {
            PathAttrValue::Aggregator { asn, address } => Some((*asn, *address)),
            _ => None,
        })
    }

    pub fn get_originator_id(&self) -> Option<Ipv4Addr> {
        self.find(|v| match v {
            PathAttrValue::OriginatorId(id) => Some(*id),
            _ => None,
        })
    }

    pub fn get_cluster_list(&self) -> Vec<Ipv4Addr> {
        self.find(|v| match v {
            PathAttrValue::ClusterList(ids) => Some(ids.clone()),
            _ => None,
        })
        .unwrap_or_default()
    }

    pub fn get_unknown_attrs(&self) -> Vec<PathAttribute> {
        self.path_attributes
            .iter()
            .filter(|attr| matches!(attr.value, PathAttrValue::Unknown { .. }))
            .cloned()
            .collect()
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, ParserError> {
        let malformed =
            || ParserError::update(UpdateMessageError::MalformedAttributeList, Vec::new());
        let body_length = bytes.len();
        if body_length < WITHDRAWN_ROUTES_LENGTH_SIZE + TOTAL_ATTR_LENGTH_SIZE {
            return Err(malformed());
        }

        let withdrawn_routes_len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
        let withdrawn_start = WITHDRAWN_ROUTES_LENGTH_SIZE;
        let withdrawn_end = withdrawn_start + withdrawn_routes_len;
        if withdrawn_end + TOTAL_ATTR_LENGTH_SIZE > body_length {
            return Err(malformed());
        }

        let total_path_attributes_len =
            u16::from_be_bytes([bytes[withdrawn_end], bytes[withdrawn_end + 1]]) as usize;
        let attrs_start = withdrawn_end + TOTAL_ATTR_LENGTH_SIZE;
        let attrs_end = attrs_start + total_path_attributes_len;
        if attrs_end > body_length {
            return Err(malformed());
        }

        let withdrawn_routes = parse_nlri_list(&bytes[withdrawn_start..withdrawn_end])?;
        let path_attributes = read_path_attributes(&bytes[attrs_start..attrs_end])?;
        let nlri_list = parse_nlri_list(&bytes[attrs_end..])?;

        Ok(UpdateMessage {
            withdrawn_routes,
            path_attributes,
            nlri_list,
        })
    }
}

impl Message for UpdateMessage {
    fn kind(&self) -> MessageType {
        MessageType::Update
    }

    fn to_bytes(&self) -> Vec<u8> {
        let withdrawn = write_nlri_list(&self.withdrawn_routes);
        let attrs = write_path_attributes(&self.path_attributes);
        let nlri = write_nlri_list(&self.nlri_list);

        let mut bytes = Vec::with_capacity(4 + withdrawn.len() + attrs.len() + nlri.len());
        bytes.extend_from_slice(&(withdrawn.len() as u16).to_be_bytes());
        bytes.extend_from_slice(&withdrawn);
        bytes.extend_from_slice(&(attrs.len() as u16).to_be_bytes());
        bytes.extend_from_slice(&attrs);
        bytes.extend_from_slice(&nlri);
        bytes
    }
}
