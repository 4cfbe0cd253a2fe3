use std::fmt;

/// Control operations carried by NET_SIG packets: add/drop/get/mod for each
/// of the four router tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpType {
    AddIface,
    DropIface,
    GetIface,
    ModIface,
    AddLink,
    DropLink,
    GetLink,
    ModLink,
    AddComtree,
    DropComtree,
    GetComtree,
    ModComtree,
    AddRoute,
    DropRoute,
    GetRoute,
    ModRoute,
}

impl CpType {
    pub fn code(self) -> u32 {
        match self {
            CpType::AddIface => 10,
            CpType::DropIface => 11,
            CpType::GetIface => 12,
            CpType::ModIface => 13,
            CpType::AddLink => 20,
            CpType::DropLink => 21,
            CpType::GetLink => 22,
            CpType::ModLink => 23,
            CpType::AddComtree => 30,
            CpType::DropComtree => 31,
            CpType::GetComtree => 32,
            CpType::ModComtree => 33,
            CpType::AddRoute => 40,
            CpType::DropRoute => 41,
            CpType::GetRoute => 42,
            CpType::ModRoute => 43,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        let cp = match code {
            10 => CpType::AddIface,
            11 => CpType::DropIface,
            12 => CpType::GetIface,
            13 => CpType::ModIface,
            20 => CpType::AddLink,
            21 => CpType::DropLink,
            22 => CpType::GetLink,
            23 => CpType::ModLink,
            30 => CpType::AddComtree,
            31 => CpType::DropComtree,
            32 => CpType::GetComtree,
            33 => CpType::ModComtree,
            40 => CpType::AddRoute,
            41 => CpType::DropRoute,
            42 => CpType::GetRoute,
            43 => CpType::ModRoute,
            _ => return None,
        };
        Some(cp)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RrType {
    Request,
    PosReply,
    NegReply,
}

impl RrType {
    fn code(self) -> u32 {
        match self {
            RrType::Request => 1,
            RrType::PosReply => 2,
            RrType::NegReply => 3,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(RrType::Request),
            2 => Some(RrType::PosReply),
            3 => Some(RrType::NegReply),
            _ => None,
        }
    }
}

/// Typed attributes of a control packet. Values are single 32-bit words;
/// addresses travel as their raw numeric form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpAttr {
    BitRate,
    ComtreeNum,
    CoreFlag,
    DestAdr,
    IfaceNum,
    LinkNum,
    LocalIp,
    MaxBitRate,
    MaxPktRate,
    ParentLink,
    PeerAdr,
    PeerDest,
    PeerIp,
    PeerPort,
    PeerType,
    PktRate,
    QueueNum,
}

impl CpAttr {
    fn code(self) -> u32 {
        match self {
            CpAttr::BitRate => 1,
            CpAttr::ComtreeNum => 2,
            CpAttr::CoreFlag => 3,
            CpAttr::DestAdr => 4,
            CpAttr::IfaceNum => 5,
            CpAttr::LinkNum => 6,
            CpAttr::LocalIp => 7,
            CpAttr::MaxBitRate => 8,
            CpAttr::MaxPktRate => 9,
            CpAttr::ParentLink => 10,
            CpAttr::PeerAdr => 11,
            CpAttr::PeerDest => 12,
            CpAttr::PeerIp => 13,
            CpAttr::PeerPort => 14,
            CpAttr::PeerType => 15,
            CpAttr::PktRate => 16,
            CpAttr::QueueNum => 17,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        let attr = match code {
            1 => CpAttr::BitRate,
            2 => CpAttr::ComtreeNum,
            3 => CpAttr::CoreFlag,
            4 => CpAttr::DestAdr,
            5 => CpAttr::IfaceNum,
            6 => CpAttr::LinkNum,
            7 => CpAttr::LocalIp,
            8 => CpAttr::MaxBitRate,
            9 => CpAttr::MaxPktRate,
            10 => CpAttr::ParentLink,
            11 => CpAttr::PeerAdr,
            12 => CpAttr::PeerDest,
            13 => CpAttr::PeerIp,
            14 => CpAttr::PeerPort,
            15 => CpAttr::PeerType,
            16 => CpAttr::PktRate,
            17 => CpAttr::QueueNum,
        _ => return None,
        };
        Some(attr)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CtlError {
    #[error("control payload truncated")]
    Truncated,
    #[error("unknown control packet type {0}")]
    UnknownCpType(u32),
    #[error("unknown request/reply type {0}")]
    UnknownRrType(u32),
    #[error("unknown attribute code {0}")]
    UnknownAttr(u32),
    #[error("malformed error message")]
    BadErrMsg,
}

/// Marks the start of an inline error message in the attribute stream.
const ERR_MSG_CODE: u32 = 0;

/// A decoded control packet.
///
/// The payload layout is a sequence of 32-bit big-endian words: command
/// type, request/reply type, a 64-bit sequence number, then (code, value)
/// attribute pairs. A negative reply may end with code 0 followed by a
/// length-prefixed UTF-8 error message padded to a word boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtlPkt {
    pub cp_type: CpType,
    pub rr_type: RrType,
    pub seq_num: u64,
    attrs: Vec<(CpAttr, u32)>,
    pub err_msg: Option<String>,
}

impl CtlPkt {
    pub fn new(cp_type: CpType, rr_type: RrType, seq_num: u64) -> Self {
        Self {
            cp_type,
            rr_type,
            seq_num,
            attrs: Vec::new(),
            err_msg: None,
        }
    }

    /// A positive reply mirroring this request's type and sequence number.
    pub fn pos_reply(&self) -> Self {
        Self::new(self.cp_type, RrType::PosReply, self.seq_num)
    }

    /// A negative reply carrying `msg`.
    pub fn neg_reply(&self, msg: impl Into<String>) -> Self {
        let mut reply = Self::new(self.cp_type, RrType::NegReply, self.seq_num);
        reply.err_msg = Some(msg.into());
        reply
    }

    pub fn set_attr(&mut self, attr: CpAttr, value: u32) -> &mut Self {
        self.attrs.retain(|(a, _)| *a != attr);
        self.attrs.push((attr, value));
        self
    }

    pub fn attr(&self, attr: CpAttr) -> Option<u32> {
        self.attrs.iter().find(|(a, _)| *a == attr).map(|(_, v)| *v)
    }

    pub fn is_set(&self, attr: CpAttr) -> bool {
        self.attr(attr).is_some()
    }

    /// Encoded size in bytes.
    pub fn packed_len(&self) -> usize {
        let mut len = 16 + 8 * self.attrs.len();
        if let Some(msg) = &self.err_msg {
            len += 8 + msg.len().div_ceil(4) * 4;
        }
        len
    }

    /// Writes the packet into `payload`, returning the number of bytes
    /// written. `payload` must hold at least [`packed_len`](Self::packed_len)
    /// bytes.
    pub fn pack(&self, payload: &mut [u8]) -> usize {
        let mut at = 0;
        let mut put = |bytes: &[u8]| {
            payload[at..at + bytes.len()].copy_from_slice(bytes);
            at += bytes.len();
        };

        put(&self.cp_type.code().to_be_bytes());
        put(&self.rr_type.code().to_be_bytes());
        put(&self.seq_num.to_be_bytes());
        for (attr, value) in &self.attrs {
            put(&attr.code().to_be_bytes());
            put(&value.to_be_bytes());
        }
        if let Some(msg) = &self.err_msg {
            put(&ERR_MSG_CODE.to_be_bytes());
            put(&(msg.len() as u32).to_be_bytes());
            put(msg.as_bytes());
            let pad = msg.len().div_ceil(4) * 4 - msg.len();
            put(&[0, 0, 0][..pad]);
        }

        at
    }

    /// Decodes a control packet from `payload`.
    pub fn unpack(payload: &[u8]) -> Result<Self, CtlError> {
        let word = |i: usize| -> Result<u32, CtlError> {
            let at = 4 * i;
            let bytes: [u8; 4] = payload
                .get(at..at + 4)
                .ok_or(CtlError::Truncated)?
                .try_into()
                .map_err(|_| CtlError::Truncated)?;
            Ok(u32::from_be_bytes(bytes))
        };

        let cp_code = word(0)?;
        let cp_type = CpType::from_code(cp_code).ok_or(CtlError::UnknownCpType(cp_code))?;
        let rr_code = word(1)?;
        let rr_type = RrType::from_code(rr_code).ok_or(CtlError::UnknownRrType(rr_code))?;
        let seq_num = (u64::from(word(2)?) << 32) | u64::from(word(3)?);

        let mut pkt = Self::new(cp_type, rr_type, seq_num);

        let total_words = payload.len() / 4;
        let mut i = 4;
        while i < total_words {
            let code = word(i)?;

            if code == ERR_MSG_CODE {
                let len = word(i + 1)? as usize;
                let start = 4 * (i + 2);
                let bytes = payload.get(start..start + len).ok_or(CtlError::Truncated)?;
                let msg = std::str::from_utf8(bytes).map_err(|_| CtlError::BadErrMsg)?;
                pkt.err_msg = Some(msg.to_owned());
                break;
            }

            let attr = CpAttr::from_code(code).ok_or(CtlError::UnknownAttr(code))?;
            pkt.set_attr(attr, word(i + 1)?);
            i += 2;
        }

        Ok(pkt)
    }
}

impl fmt::Display for CtlPkt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {:?} seq={}",
            self.cp_type, self.rr_type, self.seq_num
        )?;
        for (attr, value) in &self.attrs {
            write!(f, " {attr:?}={value}")?;
        }
        if let Some(msg) = &self.err_msg {
            write!(f, " err={msg:?}")?;
        }
        Ok(())
    }
}
