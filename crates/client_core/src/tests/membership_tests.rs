use super::*;
use shared::domain::MemberUid;

fn member(uid: &str, is_online: bool) -> Member {
    Member {
        uid: MemberUid::new(uid),
        username: uid.to_uppercase(),
        is_online,
    }
}

#[test]
fn online_count_tracks_every_snapshot() {
    let mut projector = MembershipProjector::new();
    projector.reveal();

    projector.apply_roster(vec![member("a", true), member("b", false), member("c", true)]);
    assert_eq!(projector.online_count(), 2);

    projector.apply_roster(vec![member("a", false), member("b", false)]);
    assert_eq!(projector.online_count(), 0);
    assert_eq!(projector.members().len(), 2);
}

#[test]
fn hidden_roster_reads_as_empty() {
    let mut projector = MembershipProjector::new();
    projector.apply_roster(vec![member("a", true)]);
    assert!(!projector.is_visible());
    assert!(projector.members().is_empty());
    assert_eq!(projector.online_count(), 0);

    projector.reveal();
    assert_eq!(projector.online_count(), 1);

    projector.hide();
    projector.apply_roster(vec![member("a", true), member("b", true)]);
    assert_eq!(projector.online_count(), 0);
    projector.reveal();
    assert_eq!(projector.online_count(), 2);
}
