use shared::protocol::Member;

/// Latest server roster snapshot plus whether it may be shown.
///
/// The online count is always derived from the snapshot. While hidden (during
/// a reconnect) the roster reads as empty.
#[derive(Debug, Default)]
pub struct MembershipProjector {
    roster: Vec<Member>,
    visible: bool,
}

impl MembershipProjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_roster(&mut self, members: Vec<Member>) {
        self.roster = members;
    }

    pub fn members(&self) -> &[Member] {
        if self.visible {
            &self.roster
        } else {
            &[]
        }
    }

    pub fn online_count(&self) -> usize {
        self.members().iter().filter(|m| m.is_online).count()
    }

    pub fn hide(&mut self) {
        self.visible = false;
    }

    pub fn reveal(&mut self) {
        self.visible = true;
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }
}

#[cfg(test)]
#[path = "tests/membership_tests.rs"]
mod tests;
