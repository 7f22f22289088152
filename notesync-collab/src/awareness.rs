//! Ephemeral per-peer presence.
//!
//! Awareness is best-effort: it rides the room connection, is never part of
//! the document state, and is discarded on disconnect.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use notesync_core::EditingMode;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Cursor position in page coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
}

/// Stable per-user display color.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl CursorColor {
    /// Vivid HSL color whose hue is derived from the id.
    pub fn from_uuid(id: Uuid) -> Self {
        let hue = ((id.as_u128() % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b }
    }

    pub fn to_hex(&self) -> String {
        let channel = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!("#{:02x}{:02x}{:02x}", channel(self.r), channel(self.g), channel(self.b))
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        p + (q - p) * 6.0 * t
    } else if t < 0.5 {
        q
    } else if t < 2.0 / 3.0 {
        p + (q - p) * (2.0 / 3.0 - t) * 6.0
    } else {
        p
    }
}

/// What one user is doing right now.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessState {
    pub user_id: Uuid,
    pub name: String,
    pub color: String,
    pub cursor: Option<CursorPosition>,
    pub selected_frame_id: Option<String>,
    pub mode: Option<EditingMode>,
}

impl AwarenessState {
    pub fn new(user_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            user_id,
            name: name.into(),
            color: CursorColor::from_uuid(user_id).to_hex(),
            cursor: None,
            selected_frame_id: None,
            mode: None,
        }
    }
}

struct RemotePeer {
    state: AwarenessState,
    last_seen: Instant,
}

/// Remote awareness states for one room, keyed by peer id.
pub struct PresenceRoom {
    local_peer_id: Uuid,
    peers: HashMap<Uuid, RemotePeer>,
    idle_timeout: Duration,
}

impl PresenceRoom {
    pub fn new(local_peer_id: Uuid) -> Self {
        Self::with_idle_timeout(local_peer_id, Duration::from_secs(30))
    }

    pub fn with_idle_timeout(local_peer_id: Uuid, idle_timeout: Duration) -> Self {
        Self {
            local_peer_id,
            peers: HashMap::new(),
            idle_timeout,
        }
    }

    /// Record a state received from `peer_id`. Our own echoes are ignored.
    pub fn handle(&mut self, peer_id: Uuid, state: AwarenessState) {
        if peer_id == self.local_peer_id {
            return;
        }
        self.peers.insert(
            peer_id,
            RemotePeer {
                state,
                last_seen: Instant::now(),
            },
        );
    }

    pub fn remove(&mut self, peer_id: &Uuid) -> Option<AwarenessState> {
        self.peers.remove(peer_id).map(|p| p.state)
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }

    pub fn peer(&self, peer_id: &Uuid) -> Option<&AwarenessState> {
        self.peers.get(peer_id).map(|p| &p.state)
    }

    pub fn peers(&self) -> Vec<AwarenessState> {
        self.peers.values().map(|p| p.state.clone()).collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Drop peers not heard from within the idle timeout.
    pub fn prune_idle(&mut self) -> Vec<Uuid> {
        let timeout = self.idle_timeout;
        let stale: Vec<Uuid> = self
            .peers
            .iter()
            .filter(|(_, p)| p.last_seen.elapsed() > timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            self.peers.remove(id);
        }
        stale
    }

    pub fn local_peer_id(&self) -> Uuid {
        self.local_peer_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_is_stable_hex() {
        let id = Uuid::new_v4();
        let hex = CursorColor::from_uuid(id).to_hex();
        assert_eq!(hex, CursorColor::from_uuid(id).to_hex());
        assert_eq!(hex.len(), 7);
        assert!(hex[1..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_own_state_ignored() {
        let me = Uuid::new_v4();
        let mut room = PresenceRoom::new(me);
        room.handle(me, AwarenessState::new(me, "me"));
        assert_eq!(room.peer_count(), 0);
    }

    #[test]
    fn test_handle_replaces_previous_state() {
        let mut room = PresenceRoom::new(Uuid::new_v4());
        let peer = Uuid::new_v4();
        let mut state = AwarenessState::new(peer, "Alice");
        room.handle(peer, state.clone());

        state.cursor = Some(CursorPosition { x: 4.0, y: 2.0 });
        state.mode = Some(EditingMode::Handwrite);
        room.handle(peer, state.clone());

        assert_eq!(room.peer_count(), 1);
        assert_eq!(room.peer(&peer), Some(&state));
    }

    #[test]
    fn test_remove_and_clear() {
        let mut room = PresenceRoom::new(Uuid::new_v4());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        room.handle(a, AwarenessState::new(a, "a"));
        room.handle(b, AwarenessState::new(b, "b"));

        assert_eq!(room.remove(&a).map(|s| s.name), Some("a".to_string()));
        assert_eq!(room.peers().len(), 1);
        room.clear();
        assert_eq!(room.peer_count(), 0);
    }

    #[test]
    fn test_prune_idle() {
        let mut room = PresenceRoom::with_idle_timeout(Uuid::new_v4(), Duration::from_millis(10));
        let peer = Uuid::new_v4();
        room.handle(peer, AwarenessState::new(peer, "idle"));
        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(room.prune_idle(), vec![peer]);
        assert_eq!(room.peer_count(), 0);
    }
}
