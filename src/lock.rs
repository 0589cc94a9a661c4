use chrono::{DateTime, Utc};

/// Faculty role as stored on review specs and requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Guide,
    Panel,
}

impl Role {
    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "guide" => Some(Role::Guide),
            "panel" => Some(Role::Panel),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Guide => "guide",
            Role::Panel => "panel",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
}

impl RequestStatus {
    pub fn parse(s: &str) -> Option<RequestStatus> {
        match s {
            "pending" => Some(RequestStatus::Pending),
            "approved" => Some(RequestStatus::Approved),
            "rejected" => Some(RequestStatus::Rejected),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Approved => "approved",
            RequestStatus::Rejected => "rejected",
        }
    }
}

/// Team-level rollup of per-student latest request statuses.
/// Priority: pending > approved > none.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeamRequestStatus {
    Pending,
    Approved,
    None,
}

impl TeamRequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TeamRequestStatus::Pending => "pending",
            TeamRequestStatus::Approved => "approved",
            TeamRequestStatus::None => "none",
        }
    }
}

/// Guide-phase PPT approval rollup across a team.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PptStatus {
    Complete,
    Partial,
    None,
}

impl PptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PptStatus::Complete => "approved",
            PptStatus::Partial => "partial",
            PptStatus::None => "none",
        }
    }
}

pub fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// The deadline that actually applies to a student once extension state is
/// taken into account. An approved extension substitutes the team's latest
/// override; without one the rubric deadline stands (including when the
/// approved override row is somehow missing).
pub fn effective_deadline(
    spec_to: Option<DateTime<Utc>>,
    extension_approved: bool,
    override_to: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    if extension_approved {
        override_to.or(spec_to)
    } else {
        spec_to
    }
}

/// The core editability predicate. Evaluation order matters:
/// 1. an explicit hard lock wins over everything;
/// 2. a guide looking at a panel-owned review is never deadline-locked
///    (the view is informational, not editable, so no lock applies);
/// 3. no deadline means never locked by time;
/// 4. otherwise locked iff now is past the effective deadline.
pub fn is_locked(
    hard_locked: bool,
    role: Role,
    owner: Role,
    effective_deadline: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    if hard_locked {
        return true;
    }
    if role == Role::Guide && owner == Role::Panel {
        return false;
    }
    match effective_deadline {
        None => false,
        Some(d) => now > d,
    }
}

pub fn ppt_status<I>(flags: I) -> PptStatus
where
    I: IntoIterator<Item = bool>,
{
    let mut total: usize = 0;
    let mut approved: usize = 0;
    for f in flags {
        total += 1;
        if f {
            approved += 1;
        }
    }
    if total > 0 && approved == total {
        PptStatus::Complete
    } else if approved > 0 {
        PptStatus::Partial
    } else {
        PptStatus::None
    }
}

/// Panel editing on a PPT-requiring review is blocked until the guide phase
/// fully completes. Partial approval still blocks; it only changes display.
pub fn ppt_blocks(requires_ppt: bool, status: PptStatus) -> bool {
    requires_ppt && status != PptStatus::Complete
}

pub fn team_request_status<I>(latest_per_student: I) -> TeamRequestStatus
where
    I: IntoIterator<Item = Option<RequestStatus>>,
{
    let mut any_approved = false;
    for s in latest_per_student {
        match s {
            Some(RequestStatus::Pending) => return TeamRequestStatus::Pending,
            Some(RequestStatus::Approved) => any_approved = true,
            Some(RequestStatus::Rejected) | None => {}
        }
    }
    if any_approved {
        TeamRequestStatus::Approved
    } else {
        TeamRequestStatus::None
    }
}

/// Team lock for display: locked while any student is locked, unless an
/// approved extension has reopened the team.
pub fn team_locked(any_student_locked: bool, team_status: TeamRequestStatus) -> bool {
    any_student_locked && team_status != TeamRequestStatus::Approved
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        parse_ts(s).expect("test timestamp")
    }

    #[test]
    fn deadline_passed_locks_without_extension() {
        // Rubric deadline 2025-01-10, clock at 2025-01-11.
        let deadline = effective_deadline(Some(ts("2025-01-10T00:00:00Z")), false, None);
        assert!(is_locked(
            false,
            Role::Guide,
            Role::Guide,
            deadline,
            ts("2025-01-11T00:00:00Z")
        ));
    }

    #[test]
    fn approved_extension_reopens_until_new_deadline() {
        let deadline = effective_deadline(
            Some(ts("2025-01-10T00:00:00Z")),
            true,
            Some(ts("2025-01-20T00:00:00Z")),
        );
        assert!(!is_locked(
            false,
            Role::Guide,
            Role::Guide,
            deadline,
            ts("2025-01-15T00:00:00Z")
        ));
        assert!(is_locked(
            false,
            Role::Guide,
            Role::Guide,
            deadline,
            ts("2025-01-21T00:00:00Z")
        ));
    }

    #[test]
    fn hard_lock_wins_over_approved_extension() {
        let deadline = effective_deadline(
            Some(ts("2025-01-10T00:00:00Z")),
            true,
            Some(ts("2025-01-20T00:00:00Z")),
        );
        assert!(is_locked(
            true,
            Role::Guide,
            Role::Guide,
            deadline,
            ts("2025-01-15T00:00:00Z")
        ));
    }

    #[test]
    fn guide_view_of_panel_review_never_deadline_locks() {
        let deadline = effective_deadline(Some(ts("2025-01-10T00:00:00Z")), false, None);
        assert!(!is_locked(
            false,
            Role::Guide,
            Role::Panel,
            deadline,
            ts("2025-01-11T00:00:00Z")
        ));
        // The hard lock still applies even there.
        assert!(is_locked(
            true,
            Role::Guide,
            Role::Panel,
            deadline,
            ts("2025-01-11T00:00:00Z")
        ));
    }

    #[test]
    fn open_ended_review_never_time_locks() {
        assert!(!is_locked(
            false,
            Role::Panel,
            Role::Panel,
            None,
            ts("2099-01-01T00:00:00Z")
        ));
    }

    #[test]
    fn ppt_rollup_distinguishes_partial_from_complete() {
        assert_eq!(ppt_status([true, true, true]), PptStatus::Complete);
        assert_eq!(ppt_status([true, false, true]), PptStatus::Partial);
        assert_eq!(ppt_status([false, false]), PptStatus::None);
        // An empty team has nobody approved; gate stays closed.
        assert_eq!(ppt_status([]), PptStatus::None);
        assert!(ppt_blocks(true, PptStatus::Partial));
        assert!(!ppt_blocks(true, PptStatus::Complete));
        assert!(!ppt_blocks(false, PptStatus::None));
    }

    #[test]
    fn team_request_status_priority() {
        assert_eq!(
            team_request_status([
                Some(RequestStatus::Approved),
                Some(RequestStatus::Pending),
                None
            ]),
            TeamRequestStatus::Pending
        );
        assert_eq!(
            team_request_status([Some(RequestStatus::Approved), Some(RequestStatus::Rejected)]),
            TeamRequestStatus::Approved
        );
        assert_eq!(
            team_request_status([Some(RequestStatus::Rejected), None]),
            TeamRequestStatus::None
        );
    }

    #[test]
    fn team_lock_clears_under_approved_status() {
        assert!(team_locked(true, TeamRequestStatus::None));
        assert!(team_locked(true, TeamRequestStatus::Pending));
        assert!(!team_locked(true, TeamRequestStatus::Approved));
        assert!(!team_locked(false, TeamRequestStatus::None));
    }
}
