//! Pure event reducer
//!
//! `reduce(state, event) -> state` with no I/O. Unknown tags and events that
//! reference cells outside the grid are no-ops, never errors.

use crate::event::{
    ClockAction, Coord, Event, EventKind, ResetParams, Scope, Timestamp, UpdateCellParams,
};
use crate::game::state::{ChatMessage, Cursor, GameState, Ping, MAX_PINGS};

/// Apply one event
pub fn reduce(mut state: GameState, event: &Event) -> GameState {
    let at = event.timestamp;

    match &event.kind {
        EventKind::Create(params) => {
            return GameState::from_puzzle(&params.pid, &params.puzzle, at);
        }
        EventKind::UpdateCell(params) => {
            update_cell(&mut state, params, event.user.as_deref(), at);
        }
        EventKind::UpdateCursor(params) => {
            if state.is_white(params.cell) {
                state.cursors.insert(
                    params.id.clone(),
                    Cursor {
                        cell: params.cell,
                        timestamp: at,
                    },
                );
            }
        }
        EventKind::AddPing(params) => {
            if state.is_white(params.cell) {
                state.pings.push(Ping {
                    id: params.id.clone(),
                    cell: params.cell,
                    timestamp: at,
                });
                if state.pings.len() > MAX_PINGS {
                    let excess = state.pings.len() - MAX_PINGS;
                    state.pings.drain(..excess);
                }
            }
        }
        EventKind::UpdateDisplayName(params) => {
            state.users.entry(params.id.clone()).or_default().display_name =
                Some(params.display_name.clone());
        }
        EventKind::UpdateColor(params) => {
            state.users.entry(params.id.clone()).or_default().color = Some(params.color.clone());
        }
        EventKind::UpdateClock(params) => match params.action {
            ClockAction::Start if !state.solved => state.clock.start(at),
            ClockAction::Start => {}
            ClockAction::Pause => state.clock.pause(at),
            ClockAction::Reset => state.clock.reset(at),
        },
        EventKind::Check(params) => check(&mut state, &params.scope, at),
        EventKind::Reveal(params) => reveal(&mut state, &params.scope, at),
        EventKind::Reset(params) => reset(&mut state, params, at),
        EventKind::Chat(params) => state.chat.push(ChatMessage {
            sender_id: params.sender_id.clone(),
            sender: params.sender.clone(),
            text: params.text.clone(),
            timestamp: at,
        }),
        EventKind::UpdateTeamId(params) => {
            state.users.entry(params.id.clone()).or_default().team_id = Some(params.team_id);
        }
        EventKind::UpdateTeamName(params) => {
            state.team_names.insert(params.team_id, params.name.clone());
        }
        EventKind::StartBattle(params) => {
            if state.battle_started_at.is_none() {
                state.battle_started_at = Some(params.started_at);
                state.clock.start(params.started_at);
            }
        }
        EventKind::Unknown { .. } => {}
    }

    state
}

/// Fold `create` followed by `events` into a fresh state
pub fn replay<'a, I>(create: Option<&Event>, events: I) -> GameState
where
    I: IntoIterator<Item = &'a Event>,
{
    let initial = match create {
        Some(create) => reduce(GameState::default(), create),
        None => GameState::default(),
    };
    events.into_iter().fold(initial, reduce)
}

fn update_cell(state: &mut GameState, params: &UpdateCellParams, user: Option<&str>, at: Timestamp) {
    // Keep at most one character; control characters are not cell values
    let value: String = params.value.chars().take(1).collect();
    if value.chars().any(char::is_control) {
        return;
    }

    let correct = state
        .solution_at(params.cell)
        .is_some_and(|answer| value.eq_ignore_ascii_case(answer));

    let Some(cell) = state.cell_mut(params.cell) else {
        return;
    };
    if cell.black || cell.is_locked() {
        return;
    }

    cell.value = value;
    cell.pencil = params.pencil && cell.is_filled();
    cell.incorrect = false;
    cell.attribution = if cell.is_filled() {
        user.map(str::to_string)
    } else {
        None
    };

    if params.autocheck && cell.is_filled() {
        if correct {
            cell.checked = true;
            cell.pencil = false;
        } else {
            cell.incorrect = true;
        }
    }

    refresh_solved(state, at);
}

fn check(state: &mut GameState, scope: &Scope, at: Timestamp) {
    for coord in state.cells_in_scope(scope) {
        let correct = state.is_correct(coord);
        if let Some(cell) = state.cell_mut(coord) {
            if !cell.is_filled() {
                continue;
            }
            if correct {
                cell.checked = true;
                cell.incorrect = false;
                cell.pencil = false;
            } else {
                cell.incorrect = true;
            }
        }
    }
    refresh_solved(state, at);
}

fn reveal(state: &mut GameState, scope: &Scope, at: Timestamp) {
    for coord in state.cells_in_scope(scope) {
        let Some(answer) = state.solution_at(coord).map(str::to_string) else {
            continue;
        };
        if let Some(cell) = state.cell_mut(coord) {
            if cell.revealed || (cell.checked && cell.value == answer) {
                continue;
            }
            cell.value = answer;
            cell.revealed = true;
            cell.checked = true;
            cell.incorrect = false;
            cell.pencil = false;
        }
    }
    refresh_solved(state, at);
}

/// Without `force`, checked or revealed cells keep their value and flags.
/// With `force`, every cell in scope is cleared and loses those flags too.
fn reset(state: &mut GameState, params: &ResetParams, at: Timestamp) {
    for coord in state.cells_in_scope(&params.scope) {
        if let Some(cell) = state.cell_mut(coord) {
            if cell.is_locked() && !params.force {
                continue;
            }
            cell.value.clear();
            cell.pencil = false;
            cell.incorrect = false;
            cell.attribution = None;
            if params.force {
                cell.checked = false;
                cell.revealed = false;
            }
        }
    }
    refresh_solved(state, at);
}

/// Recompute `solved`; reaching solved pauses the clock
fn refresh_solved(state: &mut GameState, at: Timestamp) {
    let solved = state.all_correct();
    if solved && !state.solved {
        state.clock.pause(at);
    }
    state.solved = solved;
}

/// Cells whose value differs from the solution (for hints/scoring)
pub fn incorrect_cells(state: &GameState) -> Vec<Coord> {
    state
        .cells_in_scope(&Scope::All)
        .into_iter()
        .filter(|at| {
            state
                .cell(*at)
                .is_some_and(|cell| cell.is_filled() && !state.is_correct(*at))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{
        ChatParams, CreateParams, PuzzleDocument, ScopeParams, StartBattleParams,
        UpdateClockParams, UpdateCursorParams, UpdateTeamIdParams,
    };

    fn ev(kind: EventKind, at: Timestamp) -> Event {
        Event::new(kind, Some("alice".to_string()), at)
    }

    fn create(rows: &[&str]) -> Event {
        ev(
            EventKind::Create(CreateParams {
                pid: "p1".to_string(),
                puzzle: PuzzleDocument::from_rows(rows),
            }),
            1_000,
        )
    }

    fn fill(row: usize, col: usize, value: &str, autocheck: bool) -> EventKind {
        EventKind::UpdateCell(UpdateCellParams {
            cell: Coord::new(row, col),
            value: value.to_string(),
            pencil: false,
            autocheck,
        })
    }

    fn clock(action: ClockAction) -> EventKind {
        EventKind::UpdateClock(UpdateClockParams { action })
    }

    fn run(rows: &[&str], kinds: Vec<EventKind>) -> GameState {
        let create = create(rows);
        let events: Vec<Event> = kinds
            .into_iter()
            .enumerate()
            .map(|(i, kind)| ev(kind, 2_000 + i as i64 * 1_000))
            .collect();
        replay(Some(&create), &events)
    }

    #[test]
    fn test_autocheck_marks_correct_cell() {
        let state = run(&["A"], vec![fill(0, 0, "A", true)]);
        let cell = state.cell(Coord::new(0, 0)).unwrap();
        assert_eq!(cell.value, "A");
        assert!(cell.checked);
        assert!(!cell.incorrect);
        assert!(state.solved);
    }

    #[test]
    fn test_autocheck_marks_wrong_cell() {
        let state = run(&["AB"], vec![fill(0, 0, "Z", true)]);
        let cell = state.cell(Coord::new(0, 0)).unwrap();
        assert!(!cell.checked);
        assert!(cell.incorrect);
    }

    #[test]
    fn test_update_cell_attribution_and_clear() {
        let state = run(&["AB"], vec![fill(0, 1, "x", false)]);
        let cell = state.cell(Coord::new(0, 1)).unwrap();
        assert_eq!(cell.attribution.as_deref(), Some("alice"));

        let state = run(&["AB"], vec![fill(0, 1, "X", false), fill(0, 1, "", false)]);
        let cell = state.cell(Coord::new(0, 1)).unwrap();
        assert!(!cell.is_filled());
        assert!(cell.attribution.is_none());
    }

    #[test]
    fn test_update_cell_keeps_one_char() {
        let state = run(&["AB"], vec![fill(0, 0, "XYZ", false)]);
        assert_eq!(state.cell(Coord::new(0, 0)).unwrap().value, "X");
    }

    #[test]
    fn test_locked_cells_ignore_edits() {
        let state = run(&["AB"], vec![fill(0, 0, "A", true), fill(0, 0, "Q", false)]);
        assert_eq!(state.cell(Coord::new(0, 0)).unwrap().value, "A");
    }

    #[test]
    fn test_out_of_range_and_black_are_noops() {
        let before = run(&["A."], vec![]);
        let after = run(&["A."], vec![fill(0, 1, "Q", false), fill(7, 7, "Q", false)]);
        assert_eq!(before.grid, after.grid);
    }

    #[test]
    fn test_check_scope() {
        let state = run(
            &["AB"],
            vec![
                fill(0, 0, "A", false),
                fill(0, 1, "Z", false),
                EventKind::Check(ScopeParams { scope: Scope::All }),
            ],
        );
        assert!(state.cell(Coord::new(0, 0)).unwrap().checked);
        assert!(state.cell(Coord::new(0, 1)).unwrap().incorrect);
        assert!(!state.cell(Coord::new(0, 1)).unwrap().checked);
    }

    #[test]
    fn test_check_skips_empty_cells() {
        let state = run(
            &["AB"],
            vec![EventKind::Check(ScopeParams { scope: Scope::All })],
        );
        let cell = state.cell(Coord::new(0, 0)).unwrap();
        assert!(!cell.checked && !cell.incorrect);
    }

    #[test]
    fn test_reveal_explicit_scope() {
        let state = run(
            &["AB"],
            vec![EventKind::Reveal(ScopeParams {
                scope: Scope::single(Coord::new(0, 1)),
            })],
        );
        let cell = state.cell(Coord::new(0, 1)).unwrap();
        assert_eq!(cell.value, "B");
        assert!(cell.revealed && cell.checked);
        assert!(!state.cell(Coord::new(0, 0)).unwrap().is_filled());
        assert!(!state.solved);
    }

    #[test]
    fn test_reset_without_force_keeps_verified_cells() {
        let state = run(
            &["ABC"],
            vec![
                fill(0, 0, "A", true),
                EventKind::Reveal(ScopeParams {
                    scope: Scope::single(Coord::new(0, 1)),
                }),
                fill(0, 2, "Q", false),
                EventKind::Reset(ResetParams {
                    scope: Scope::All,
                    force: false,
                }),
            ],
        );
        let a = state.cell(Coord::new(0, 0)).unwrap();
        let b = state.cell(Coord::new(0, 1)).unwrap();
        let c = state.cell(Coord::new(0, 2)).unwrap();
        assert_eq!(a.value, "A");
        assert!(a.checked);
        assert_eq!(b.value, "B");
        assert!(b.revealed);
        assert!(!c.is_filled());
    }

    #[test]
    fn test_reset_with_force_clears_everything() {
        let state = run(
            &["ABC"],
            vec![
                fill(0, 0, "A", true),
                EventKind::Reveal(ScopeParams {
                    scope: Scope::single(Coord::new(0, 1)),
                }),
                fill(0, 2, "Q", false),
                EventKind::Reset(ResetParams {
                    scope: Scope::All,
                    force: true,
                }),
            ],
        );
        for col in 0..3 {
            let cell = state.cell(Coord::new(0, col)).unwrap();
            assert!(!cell.is_filled(), "col {} still filled", col);
            assert!(!cell.checked && !cell.revealed && !cell.incorrect);
        }
    }

    #[test]
    fn test_solving_pauses_clock() {
        let state = run(
            &["AB"],
            vec![
                clock(ClockAction::Start),  // t=2000
                fill(0, 0, "A", false),     // t=3000
                fill(0, 1, "B", false),     // t=4000 solves
                clock(ClockAction::Start),  // ignored once solved
            ],
        );
        assert!(state.solved);
        assert!(!state.clock.running);
        assert_eq!(state.clock.elapsed_time, 2_000);
        assert_eq!(state.clock.elapsed_at(99_000), 2_000);
    }

    #[test]
    fn test_clock_pause_and_reset() {
        let state = run(
            &["AB"],
            vec![clock(ClockAction::Start), clock(ClockAction::Pause)],
        );
        assert_eq!(state.clock.elapsed_time, 1_000);
        assert!(!state.clock.running);

        let state = run(
            &["AB"],
            vec![
                clock(ClockAction::Start),
                clock(ClockAction::Pause),
                clock(ClockAction::Reset),
            ],
        );
        assert_eq!(state.clock.elapsed_time, 0);
    }

    #[test]
    fn test_presence_and_chat() {
        let state = run(
            &["AB"],
            vec![
                EventKind::UpdateCursor(UpdateCursorParams {
                    id: "bob".to_string(),
                    cell: Coord::new(0, 1),
                }),
                EventKind::Chat(ChatParams {
                    sender_id: "bob".to_string(),
                    sender: "Bob".to_string(),
                    text: "hi".to_string(),
                }),
            ],
        );
        assert_eq!(state.cursors["bob"].cell, Coord::new(0, 1));
        assert_eq!(state.chat.len(), 1);
        assert_eq!(state.chat[0].text, "hi");
    }

    #[test]
    fn test_battle_events() {
        let state = run(
            &["AB"],
            vec![
                EventKind::UpdateTeamId(UpdateTeamIdParams {
                    id: "bob".to_string(),
                    team_id: 1,
                }),
                EventKind::StartBattle(StartBattleParams { started_at: 5_000 }),
                EventKind::StartBattle(StartBattleParams { started_at: 9_000 }),
            ],
        );
        assert_eq!(state.team_of("bob"), Some(1));
        assert_eq!(state.battle_started_at, Some(5_000));
        assert!(state.clock.running);
    }

    #[test]
    fn test_unknown_event_is_noop() {
        let before = run(&["AB"], vec![fill(0, 0, "A", false)]);
        let after = run(
            &["AB"],
            vec![
                fill(0, 0, "A", false),
                EventKind::Unknown {
                    tag: "future".to_string(),
                    params: serde_json::Value::Null,
                },
            ],
        );
        assert_eq!(before, after);
    }

    #[test]
    fn test_events_before_create_are_harmless() {
        let events = vec![ev(fill(0, 0, "A", false), 10)];
        let state = replay(None, &events);
        assert!(!state.is_created());
        assert!(state.grid.is_empty());
    }

    #[test]
    fn test_incorrect_cells() {
        let state = run(&["ABC"], vec![fill(0, 0, "A", false), fill(0, 2, "Z", false)]);
        assert_eq!(incorrect_cells(&state), vec![Coord::new(0, 2)]);
    }
}
