//! Room directory for Parlor.
//!
//! Rooms are named, owner-managed spaces. The member count stored on a room
//! is a cached projection of the session registry; capacity decisions always
//! recount live sessions instead of trusting it.

use crate::identity::UserId;
use crate::message::now_millis;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parlor_protocol::RoomView;
use thiserror::Error;
use tracing::debug;

/// Maximum room name length in characters.
pub const MAX_ROOM_NAME_LENGTH: usize = 64;

/// Maximum room description length in characters.
pub const MAX_ROOM_DESCRIPTION_LENGTH: usize = 512;

/// A room identifier.
pub type RoomId = String;

/// Directory errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoomError {
    #[error("Room not found: {0}")]
    NotFound(RoomId),

    #[error("Only the room owner can do that")]
    NotOwner,

    #[error("Room capacity must be at least 1")]
    InvalidCapacity,

    #[error("Room already exists: {0}")]
    Exists(RoomId),

    #[error("{0}")]
    InvalidName(&'static str),
}

/// Validate a room name.
///
/// # Errors
///
/// Returns an error message if the room name is invalid.
pub fn validate_room_name(name: &str) -> Result<(), &'static str> {
    if name.trim().is_empty() {
        return Err("Room name cannot be empty");
    }
    if name.chars().count() > MAX_ROOM_NAME_LENGTH {
        return Err("Room name too long");
    }
    if name.chars().any(char::is_control) {
        return Err("Room name contains invalid characters");
    }
    Ok(())
}

/// Room metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub description: String,
    pub owner_id: UserId,
    pub owner_name: String,
    pub is_open: bool,
    pub max_users: u32,
    /// Cached member count. Recomputed from the registry after every move.
    pub current_users: usize,
    pub created_at: u64,
}

impl Room {
    /// Create a new open, empty room.
    #[must_use]
    pub fn new(
        id: impl Into<RoomId>,
        name: impl Into<String>,
        description: impl Into<String>,
        owner_id: impl Into<UserId>,
        owner_name: impl Into<String>,
        max_users: u32,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            owner_id: owner_id.into(),
            owner_name: owner_name.into(),
            is_open: true,
            max_users,
            current_users: 0,
            created_at: now_millis(),
        }
    }

    /// Check if the given user owns this room.
    #[must_use]
    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.owner_id == user_id
    }

    /// Check a room before it is persisted.
    ///
    /// # Errors
    ///
    /// Returns an error if the capacity or the name is invalid.
    pub fn validate(&self) -> Result<(), RoomError> {
        if self.max_users < 1 {
            return Err(RoomError::InvalidCapacity);
        }
        validate_room_name(&self.name).map_err(RoomError::InvalidName)?;
        if self.description.chars().count() > MAX_ROOM_DESCRIPTION_LENGTH {
            return Err(RoomError::InvalidName("Room description too long"));
        }
        Ok(())
    }

    /// Public listing form of this room.
    #[must_use]
    pub fn to_view(&self) -> RoomView {
        RoomView {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            owner_id: self.owner_id.clone(),
            owner_name: self.owner_name.clone(),
            is_open: self.is_open,
            max_users: self.max_users,
            current_users: self.current_users,
            created_at: self.created_at,
        }
    }
}

/// Shared directory of all rooms.
#[derive(Debug, Default)]
pub struct RoomDirectory {
    rooms: DashMap<RoomId, Room>,
}

impl RoomDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore rooms loaded from storage.
    ///
    /// No session survives a restart, so every count starts at zero.
    pub fn load(&self, rooms: impl IntoIterator<Item = Room>) -> usize {
        let mut loaded = 0;
        for mut room in rooms {
            room.current_users = 0;
            self.rooms.insert(room.id.clone(), room);
            loaded += 1;
        }
        debug!(rooms = loaded, "Rooms restored");
        loaded
    }

    /// Check that a room may be created, without inserting it.
    ///
    /// # Errors
    ///
    /// Returns an error if the room is invalid or the id is taken.
    pub fn check_new(&self, room: &Room) -> Result<(), RoomError> {
        room.validate()?;
        if self.rooms.contains_key(&room.id) {
            return Err(RoomError::Exists(room.id.clone()));
        }
        Ok(())
    }

    /// Insert a new room.
    ///
    /// # Errors
    ///
    /// Returns an error if the room is invalid or the id is taken.
    pub fn create(&self, room: Room) -> Result<Room, RoomError> {
        room.validate()?;
        match self.rooms.entry(room.id.clone()) {
            Entry::Occupied(_) => Err(RoomError::Exists(room.id)),
            Entry::Vacant(slot) => {
                debug!(room = %room.id, owner = %room.owner_id, "Room created");
                slot.insert(room.clone());
                Ok(room)
            }
        }
    }

    /// Get a snapshot of a room.
    #[must_use]
    pub fn get(&self, room_id: &str) -> Option<Room> {
        self.rooms.get(room_id).map(|r| r.clone())
    }

    /// Check if a room exists.
    #[must_use]
    pub fn contains(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    /// Open rooms, newest first.
    #[must_use]
    pub fn list_open(&self) -> Vec<Room> {
        let mut rooms: Vec<Room> = self
            .rooms
            .iter()
            .filter(|r| r.is_open)
            .map(|r| r.value().clone())
            .collect();
        rooms.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        rooms
    }

    /// Listing views of the open rooms, newest first.
    #[must_use]
    pub fn open_views(&self) -> Vec<RoomView> {
        self.list_open().iter().map(Room::to_view).collect()
    }

    /// Number of open rooms.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.rooms.iter().filter(|r| r.is_open).count()
    }

    /// Run `f` with exclusive access to a room.
    ///
    /// The room's entry stays locked for the duration of `f`, which
    /// serializes membership changes for that room. `f` must not call back
    /// into the directory.
    pub fn with_room_mut<R>(&self, room_id: &str, f: impl FnOnce(&mut Room) -> R) -> Option<R> {
        let mut room = self.rooms.get_mut(room_id)?;
        Some(f(&mut room))
    }

    /// Set whether a room is open. Idempotent.
    pub fn set_open(&self, room_id: &str, is_open: bool) -> bool {
        self.with_room_mut(room_id, |room| room.is_open = is_open)
            .is_some()
    }

    /// Set the cached member count. Idempotent.
    pub fn set_user_count(&self, room_id: &str, count: usize) -> bool {
        self.with_room_mut(room_id, |room| room.current_users = count)
            .is_some()
    }

    /// Check that `user_id` owns a room.
    ///
    /// # Errors
    ///
    /// Returns an error if the room is unknown or owned by someone else.
    pub fn check_owner(&self, room_id: &str, user_id: &str) -> Result<Room, RoomError> {
        let room = self
            .get(room_id)
            .ok_or_else(|| RoomError::NotFound(room_id.to_string()))?;
        if !room.is_owned_by(user_id) {
            return Err(RoomError::NotOwner);
        }
        Ok(room)
    }

    /// Mark a room closed on behalf of its owner.
    ///
    /// # Errors
    ///
    /// Returns an error if the room is unknown or owned by someone else.
    pub fn close(&self, room_id: &str, requested_by: &str) -> Result<Room, RoomError> {
        self.check_owner(room_id, requested_by)?;
        if !self.set_open(room_id, false) {
            return Err(RoomError::NotFound(room_id.to_string()));
        }
        self.set_user_count(room_id, 0);
        debug!(room = %room_id, "Room closed");

        self.get(room_id)
            .ok_or_else(|| RoomError::NotFound(room_id.to_string()))
    }

    /// Remove a room entirely.
    pub fn remove(&self, room_id: &str) -> Option<Room> {
        self.rooms.remove(room_id).map(|(_, room)| room)
    }

    /// Total number of rooms, open or closed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    /// Check if the directory is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room(id: &str, max_users: u32) -> Room {
        Room::new(id, "Tech", "All things tech", "owner-1", "Olive", max_users)
    }

    #[test]
    fn test_create_and_get() {
        let directory = RoomDirectory::new();
        let created = directory.create(room("tech", 5)).unwrap();

        assert!(created.is_open);
        assert_eq!(created.current_users, 0);
        assert_eq!(directory.get("tech"), Some(created));
        assert!(directory.get("music").is_none());
    }

    #[test]
    fn test_create_rejects_bad_rooms() {
        let directory = RoomDirectory::new();
        assert_eq!(
            directory.create(room("tech", 0)),
            Err(RoomError::InvalidCapacity)
        );

        directory.create(room("tech", 5)).unwrap();
        assert_eq!(
            directory.create(room("tech", 5)),
            Err(RoomError::Exists("tech".to_string()))
        );

        let mut unnamed = room("blank", 5);
        unnamed.name = "   ".to_string();
        assert!(matches!(
            directory.check_new(&unnamed),
            Err(RoomError::InvalidName(_))
        ));
    }

    #[test]
    fn test_room_name_validation() {
        assert!(validate_room_name("Tech talk").is_ok());
        assert!(validate_room_name("客厅").is_ok());
        assert!(validate_room_name("").is_err());
        assert!(validate_room_name("bad\nname").is_err());
        assert!(validate_room_name(&"a".repeat(MAX_ROOM_NAME_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_list_open_newest_first() {
        let directory = RoomDirectory::new();
        let mut older = room("older", 5);
        older.created_at = 1;
        let mut newer = room("newer", 5);
        newer.created_at = 2;
        let mut closed = room("closed", 5);
        closed.created_at = 3;
        closed.is_open = false;
        directory.load([older, newer, closed]);

        let ids: Vec<_> = directory.list_open().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["newer", "older"]);
        assert_eq!(directory.open_count(), 2);
        assert_eq!(directory.len(), 3);
    }

    #[test]
    fn test_load_resets_counts() {
        let directory = RoomDirectory::new();
        let mut stale = room("tech", 5);
        stale.current_users = 4;
        directory.load([stale]);

        assert_eq!(directory.get("tech").unwrap().current_users, 0);
    }

    #[test]
    fn test_close_requires_owner() {
        let directory = RoomDirectory::new();
        directory.create(room("tech", 5)).unwrap();
        directory.set_user_count("tech", 3);

        assert_eq!(directory.close("tech", "intruder"), Err(RoomError::NotOwner));
        assert!(directory.get("tech").unwrap().is_open);

        let closed = directory.close("tech", "owner-1").unwrap();
        assert!(!closed.is_open);
        assert_eq!(closed.current_users, 0);
        assert!(directory.list_open().is_empty());

        assert_eq!(
            directory.close("music", "owner-1"),
            Err(RoomError::NotFound("music".to_string()))
        );
    }

    #[test]
    fn test_setters_are_idempotent() {
        let directory = RoomDirectory::new();
        directory.create(room("tech", 5)).unwrap();

        assert!(directory.set_open("tech", false));
        assert!(directory.set_open("tech", false));
        assert!(!directory.get("tech").unwrap().is_open);

        assert!(directory.set_user_count("tech", 2));
        assert!(directory.set_user_count("tech", 2));
        assert_eq!(directory.get("tech").unwrap().current_users, 2);

        assert!(!directory.set_open("music", true));
    }

    #[test]
    fn test_remove() {
        let directory = RoomDirectory::new();
        directory.create(room("tech", 5)).unwrap();

        assert!(directory.remove("tech").is_some());
        assert!(directory.remove("tech").is_none());
        assert!(directory.is_empty());
    }
}
