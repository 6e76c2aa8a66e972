use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Every type at or below this value is a control message handled directly
/// by the connection or the server; it is never stored in a room's log.
pub const COMMAND: u16 = 1000;

/// Every type above this value is additionally subject to the tail-merge
/// rule when appended to a room's log.
pub const OPTIMIZED_COMMANDS: u16 = 2000;

pub fn is_room_scoped(ty: u16) -> bool {
    ty > COMMAND
}

pub fn is_optimized(ty: u16) -> bool {
    ty > OPTIMIZED_COMMANDS
}

/// Control message types the core itself recognizes or emits.
///
/// Room-scoped application commands (`ty > COMMAND`) are not represented
/// here: their payload is opaque to the relay, so they travel as a raw
/// `u16` on [`crate::Command`] instead of a `MessageType` variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum MessageType {
    JoinRoom = 1,
    LeaveRoom = 2,
    ListRooms = 3,
    ListAllClients = 4,
    DeleteRoom = 5,
    SetClientName = 6,
    SetClientMetadata = 7,
    SetRoomMetadata = 8,
    SetRoomKeepOpen = 9,
    ClientId = 10,
    Content = 11,
    ClearContent = 12,
    RoomDeleted = 13,
    RoomUpdate = 14,
    ClientUpdate = 15,
    ClientDisconnected = 16,
    SendError = 17,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_partition_as_expected() {
        assert!(!is_room_scoped(COMMAND));
        assert!(is_room_scoped(COMMAND + 1));
        assert!(!is_optimized(OPTIMIZED_COMMANDS));
        assert!(is_optimized(OPTIMIZED_COMMANDS + 1));
        assert!(is_room_scoped(OPTIMIZED_COMMANDS + 1));
    }

    #[test]
    fn known_control_types_round_trip() {
        let ty: u16 = MessageType::JoinRoom.into();
        assert_eq!(MessageType::try_from(ty).unwrap(), MessageType::JoinRoom);
        assert!(!is_room_scoped(ty));
    }
}
