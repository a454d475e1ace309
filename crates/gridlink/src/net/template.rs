//! Static message schema.
//!
//! The field layout of every message is fixed by its type tag; nothing about
//! the layout is inferred from the bytes. Block and field order here is wire
//! order.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Frequency {
    High,
    Medium,
    Low,
    Fixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Bool,
    Uuid,
    Vector3,
    Quaternion,
    IpAddr,
    IpPort,
    /// Up to 255 bytes, one-byte length prefix.
    Variable1,
    /// Up to 65535 bytes, two-byte little-endian length prefix.
    Variable2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockCount {
    Single,
    Multiple(u8),
    /// Count byte on the wire, 0..=255 instances.
    Variable,
}

#[derive(Debug)]
pub struct FieldTemplate {
    pub name: &'static str,
    pub ty: FieldType,
}

#[derive(Debug)]
pub struct BlockTemplate {
    pub name: &'static str,
    pub count: BlockCount,
    pub fields: &'static [FieldTemplate],
}

#[derive(Debug)]
pub struct MessageTemplate {
    pub kind: MessageType,
    pub name: &'static str,
    pub frequency: Frequency,
    pub number: u16,
    pub blocks: &'static [BlockTemplate],
}

impl MessageTemplate {
    /// Frequency-qualified identifier, as reported in `DecodeError::UnknownType`.
    pub fn wire_id(&self) -> u32 {
        wire_id(self.frequency, self.number)
    }
}

pub fn wire_id(frequency: Frequency, number: u16) -> u32 {
    match frequency {
        Frequency::High => number as u32,
        Frequency::Medium => 0xFF00 | number as u32,
        Frequency::Low => 0xFFFF_0000 | number as u32,
        Frequency::Fixed => 0xFFFF_FF00 | number as u32,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum MessageType {
    StartPingCheck,
    CompletePingCheck,
    UseCircuitCode,
    TeleportLocationRequest,
    TeleportProgress,
    TeleportFinish,
    TeleportLureRequest,
    TeleportStart,
    TeleportFailed,
    ChatFromViewer,
    HealthMessage,
    ChatFromSimulator,
    CompleteAgentMovement,
    AgentMovementComplete,
    LogoutRequest,
    ImprovedInstantMessage,
    MoneyBalanceReply,
    MoneySummaryReply,
    AdjustBalance,
    PacketAck,
    CloseCircuit,
}

impl MessageType {
    pub const ALL: &'static [MessageType] = &[
        MessageType::StartPingCheck,
        MessageType::CompletePingCheck,
        MessageType::UseCircuitCode,
        MessageType::TeleportLocationRequest,
        MessageType::TeleportProgress,
        MessageType::TeleportFinish,
        MessageType::TeleportLureRequest,
        MessageType::TeleportStart,
        MessageType::TeleportFailed,
        MessageType::ChatFromViewer,
        MessageType::HealthMessage,
        MessageType::ChatFromSimulator,
        MessageType::CompleteAgentMovement,
        MessageType::AgentMovementComplete,
        MessageType::LogoutRequest,
        MessageType::ImprovedInstantMessage,
        MessageType::MoneyBalanceReply,
        MessageType::MoneySummaryReply,
        MessageType::AdjustBalance,
        MessageType::PacketAck,
        MessageType::CloseCircuit,
    ];

    pub fn template(self) -> &'static MessageTemplate {
        match self {
            Self::StartPingCheck => &START_PING_CHECK,
            Self::CompletePingCheck => &COMPLETE_PING_CHECK,
            Self::UseCircuitCode => &USE_CIRCUIT_CODE,
            Self::TeleportLocationRequest => &TELEPORT_LOCATION_REQUEST,
            Self::TeleportProgress => &TELEPORT_PROGRESS,
            Self::TeleportFinish => &TELEPORT_FINISH,
            Self::TeleportLureRequest => &TELEPORT_LURE_REQUEST,
            Self::TeleportStart => &TELEPORT_START,
            Self::TeleportFailed => &TELEPORT_FAILED,
            Self::ChatFromViewer => &CHAT_FROM_VIEWER,
            Self::HealthMessage => &HEALTH_MESSAGE,
            Self::ChatFromSimulator => &CHAT_FROM_SIMULATOR,
            Self::CompleteAgentMovement => &COMPLETE_AGENT_MOVEMENT,
            Self::AgentMovementComplete => &AGENT_MOVEMENT_COMPLETE,
            Self::LogoutRequest => &LOGOUT_REQUEST,
            Self::ImprovedInstantMessage => &IMPROVED_INSTANT_MESSAGE,
            Self::MoneyBalanceReply => &MONEY_BALANCE_REPLY,
            Self::MoneySummaryReply => &MONEY_SUMMARY_REPLY,
            Self::AdjustBalance => &ADJUST_BALANCE,
            Self::PacketAck => &PACKET_ACK,
            Self::CloseCircuit => &CLOSE_CIRCUIT,
        }
    }

    pub fn from_wire(frequency: Frequency, number: u16) -> Option<MessageType> {
        Self::ALL.iter().copied().find(|kind| {
            let template = kind.template();
            template.frequency == frequency && template.number == number
        })
    }

    pub fn name(self) -> &'static str {
        self.template().name
    }
}

macro_rules! fields {
    ($($name:literal : $ty:ident),* $(,)?) => {
        &[$(FieldTemplate { name: $name, ty: FieldType::$ty }),*]
    };
}

const AGENT_DATA: BlockTemplate = BlockTemplate {
    name: "AgentData",
    count: BlockCount::Single,
    fields: fields!["AgentID": Uuid, "SessionID": Uuid],
};

static START_PING_CHECK: MessageTemplate = MessageTemplate {
    kind: MessageType::StartPingCheck,
    name: "StartPingCheck",
    frequency: Frequency::High,
    number: 1,
    blocks: &[BlockTemplate {
        name: "PingID",
        count: BlockCount::Single,
        fields: fields!["PingID": U8, "OldestUnacked": U32],
    }],
};

static COMPLETE_PING_CHECK: MessageTemplate = MessageTemplate {
    kind: MessageType::CompletePingCheck,
    name: "CompletePingCheck",
    frequency: Frequency::High,
    number: 2,
    blocks: &[BlockTemplate {
        name: "PingID",
        count: BlockCount::Single,
        fields: fields!["PingID": U8],
    }],
};

static USE_CIRCUIT_CODE: MessageTemplate = MessageTemplate {
    kind: MessageType::UseCircuitCode,
    name: "UseCircuitCode",
    frequency: Frequency::Low,
    number: 3,
    blocks: &[BlockTemplate {
        name: "CircuitCode",
        count: BlockCount::Single,
        fields: fields!["Code": U32, "SessionID": Uuid, "ID": Uuid],
    }],
};

static TELEPORT_LOCATION_REQUEST: MessageTemplate = MessageTemplate {
    kind: MessageType::TeleportLocationRequest,
    name: "TeleportLocationRequest",
    frequency: Frequency::Low,
    number: 63,
    blocks: &[
        AGENT_DATA,
        BlockTemplate {
            name: "Info",
            count: BlockCount::Single,
            fields: fields!["RegionHandle": U64, "Position": Vector3, "LookAt": Vector3],
        },
    ],
};

static TELEPORT_PROGRESS: MessageTemplate = MessageTemplate {
    kind: MessageType::TeleportProgress,
    name: "TeleportProgress",
    frequency: Frequency::Low,
    number: 66,
    blocks: &[BlockTemplate {
        name: "Info",
        count: BlockCount::Single,
        fields: fields!["Message": Variable1],
    }],
};

static TELEPORT_FINISH: MessageTemplate = MessageTemplate {
    kind: MessageType::TeleportFinish,
    name: "TeleportFinish",
    frequency: Frequency::Low,
    number: 69,
    blocks: &[BlockTemplate {
        name: "Info",
        count: BlockCount::Single,
        fields: fields![
            "AgentID": Uuid,
            "SimIP": IpAddr,
            "SimPort": IpPort,
            "RegionHandle": U64,
            "CircuitCode": U32,
        ],
    }],
};

static TELEPORT_LURE_REQUEST: MessageTemplate = MessageTemplate {
    kind: MessageType::TeleportLureRequest,
    name: "TeleportLureRequest",
    frequency: Frequency::Low,
    number: 71,
    blocks: &[BlockTemplate {
        name: "Info",
        count: BlockCount::Single,
        fields: fields![
            "AgentID": Uuid,
            "SessionID": Uuid,
            "LureID": Uuid,
            "TeleportFlags": U32,
        ],
    }],
};

static TELEPORT_START: MessageTemplate = MessageTemplate {
    kind: MessageType::TeleportStart,
    name: "TeleportStart",
    frequency: Frequency::Low,
    number: 73,
    blocks: &[],
};

static TELEPORT_FAILED: MessageTemplate = MessageTemplate {
    kind: MessageType::TeleportFailed,
    name: "TeleportFailed",
    frequency: Frequency::Low,
    number: 74,
    blocks: &[BlockTemplate {
        name: "Info",
        count: BlockCount::Single,
        fields: fields!["Reason": Variable1],
    }],
};

static CHAT_FROM_VIEWER: MessageTemplate = MessageTemplate {
    kind: MessageType::ChatFromViewer,
    name: "ChatFromViewer",
    frequency: Frequency::Low,
    number: 80,
    blocks: &[
        AGENT_DATA,
        BlockTemplate {
            name: "ChatData",
            count: BlockCount::Single,
            fields: fields!["Message": Variable2, "Type": U8, "Channel": I32],
        },
    ],
};

static HEALTH_MESSAGE: MessageTemplate = MessageTemplate {
    kind: MessageType::HealthMessage,
    name: "HealthMessage",
    frequency: Frequency::Low,
    number: 138,
    blocks: &[BlockTemplate {
        name: "HealthData",
        count: BlockCount::Single,
        fields: fields!["Health": F32],
    }],
};

static CHAT_FROM_SIMULATOR: MessageTemplate = MessageTemplate {
    kind: MessageType::ChatFromSimulator,
    name: "ChatFromSimulator",
    frequency: Frequency::Low,
    number: 139,
    blocks: &[BlockTemplate {
        name: "ChatData",
        count: BlockCount::Single,
        fields: fields![
            "FromName": Variable1,
            "SourceID": Uuid,
            "OwnerID": Uuid,
            "SourceType": U8,
            "ChatType": U8,
            "Audible": U8,
            "Position": Vector3,
            "Message": Variable2,
        ],
    }],
};

static COMPLETE_AGENT_MOVEMENT: MessageTemplate = MessageTemplate {
    kind: MessageType::CompleteAgentMovement,
    name: "CompleteAgentMovement",
    frequency: Frequency::Low,
    number: 249,
    blocks: &[BlockTemplate {
        name: "AgentData",
        count: BlockCount::Single,
        fields: fields!["AgentID": Uuid, "SessionID": Uuid, "CircuitCode": U32],
    }],
};

static AGENT_MOVEMENT_COMPLETE: MessageTemplate = MessageTemplate {
    kind: MessageType::AgentMovementComplete,
    name: "AgentMovementComplete",
    frequency: Frequency::Low,
    number: 250,
    blocks: &[
        AGENT_DATA,
        BlockTemplate {
            name: "Data",
            count: BlockCount::Single,
            fields: fields![
                "Position": Vector3,
                "LookAt": Vector3,
                "RegionHandle": U64,
                "Timestamp": U32,
            ],
        },
    ],
};

static LOGOUT_REQUEST: MessageTemplate = MessageTemplate {
    kind: MessageType::LogoutRequest,
    name: "LogoutRequest",
    frequency: Frequency::Low,
    number: 252,
    blocks: &[AGENT_DATA],
};

static IMPROVED_INSTANT_MESSAGE: MessageTemplate = MessageTemplate {
    kind: MessageType::ImprovedInstantMessage,
    name: "ImprovedInstantMessage",
    frequency: Frequency::Low,
    number: 254,
    blocks: &[
        AGENT_DATA,
        BlockTemplate {
            name: "MessageBlock",
            count: BlockCount::Single,
            fields: fields![
                "FromGroup": Bool,
                "ToAgentID": Uuid,
                "ParentEstateID": U32,
                "RegionID": Uuid,
                "Position": Vector3,
                "Offline": U8,
                "Dialog": U8,
                "ID": Uuid,
                "Timestamp": U32,
                "FromAgentName": Variable1,
                "Message": Variable2,
                "BinaryBucket": Variable2,
            ],
        },
    ],
};

static MONEY_BALANCE_REPLY: MessageTemplate = MessageTemplate {
    kind: MessageType::MoneyBalanceReply,
    name: "MoneyBalanceReply",
    frequency: Frequency::Low,
    number: 314,
    blocks: &[BlockTemplate {
        name: "MoneyData",
        count: BlockCount::Single,
        fields: fields![
            "AgentID": Uuid,
            "TransactionID": Uuid,
            "TransactionSuccess": Bool,
            "MoneyBalance": I32,
            "SquareMetersCredit": I32,
            "SquareMetersCommitted": I32,
            "Description": Variable1,
        ],
    }],
};

static MONEY_SUMMARY_REPLY: MessageTemplate = MessageTemplate {
    kind: MessageType::MoneySummaryReply,
    name: "MoneySummaryReply",
    frequency: Frequency::Low,
    number: 316,
    blocks: &[BlockTemplate {
        name: "MoneyData",
        count: BlockCount::Single,
        fields: fields![
            "RequestID": Uuid,
            "AgentID": Uuid,
            "Balance": I32,
            "SquareMetersCredit": I32,
            "SquareMetersCommitted": I32,
            "CashFlowIn": I32,
            "CashFlowOut": I32,
            "CashFlowTotal": I32,
            "StartDate": Variable1,
            "EndDate": Variable1,
        ],
    }],
};

/// Balance change pushed without a request, such as a payment received.
static ADJUST_BALANCE: MessageTemplate = MessageTemplate {
    kind: MessageType::AdjustBalance,
    name: "AdjustBalance",
    frequency: Frequency::Low,
    number: 317,
    blocks: &[BlockTemplate {
        name: "AgentData",
        count: BlockCount::Single,
        fields: fields!["AgentID": Uuid, "Delta": I32],
    }],
};

static PACKET_ACK: MessageTemplate = MessageTemplate {
    kind: MessageType::PacketAck,
    name: "PacketAck",
    frequency: Frequency::Fixed,
    number: 0xFB,
    blocks: &[BlockTemplate {
        name: "Packets",
        count: BlockCount::Variable,
        fields: fields!["ID": U32],
    }],
};

static CLOSE_CIRCUIT: MessageTemplate = MessageTemplate {
    kind: MessageType::CloseCircuit,
    name: "CloseCircuit",
    frequency: Frequency::Fixed,
    number: 0xFD,
    blocks: &[],
};
