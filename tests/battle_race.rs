//! Concurrent compare-and-set behaviour of the battle store

#![cfg(feature = "battle")]

use std::sync::{Arc, Barrier};
use std::thread;

use crossword_sync::battle::BattleStore;
use crossword_sync::cache::EntityPath;
use crossword_sync::event::{Event, EventKind, PuzzleDocument, UpdateCellParams};
use crossword_sync::game::{reduce, GameState};
use crossword_sync::metrics::Metrics;
use crossword_sync::util::clock::ManualTimeSource;

fn store() -> Arc<BattleStore> {
    Arc::new(BattleStore::new(
        Arc::new(ManualTimeSource::new(50)),
        Arc::new(Metrics::new()),
    ))
}

#[test]
fn test_simultaneous_winners_resolve_to_one() {
    for round in 0..50 {
        let store = store();
        let battle = format!("battle-{}", round);
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = [0u32, 1]
            .into_iter()
            .map(|team| {
                let store = store.clone();
                let battle = battle.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    store.set_winner(&battle, team).unwrap()
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winner = store.winner(&battle).expect("winner recorded");

        // Both callers observe the same, single winner
        assert!(winner.team == 0 || winner.team == 1);
        assert!(results.iter().all(|r| r.team == winner.team));
    }
}

fn solved_board() -> GameState {
    let state = GameState::from_puzzle("p", &PuzzleDocument::from_rows(&["AB", "CD"]), 0);
    let fills = [((0, 0), "A"), ((0, 1), "B"), ((1, 0), "C"), ((1, 1), "D")];
    fills.into_iter().fold(state, |state, ((row, col), value)| {
        let event = Event::new(
            EventKind::UpdateCell(UpdateCellParams {
                cell: crossword_sync::event::Coord::new(row, col),
                value: value.to_string(),
                pencil: false,
                autocheck: false,
            }),
            Some("u".to_string()),
            1,
        );
        reduce(state, &event)
    })
}

#[test]
fn test_pickup_claimed_by_exactly_one_team() {
    let store = store();
    let board = EntityPath::game("board").unwrap();
    let state = Arc::new(solved_board());

    let spawned = store
        .spawn_powerups("b", &[(board.clone(), &*state)], 4, &mut rand::thread_rng())
        .unwrap();
    assert_eq!(spawned.len(), 4);

    for pickup in &spawned {
        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0u32..4)
            .map(|team| {
                let store = store.clone();
                let state = state.clone();
                let barrier = barrier.clone();
                let id = pickup.id;
                thread::spawn(move || {
                    barrier.wait();
                    store.claim_pickup("b", id, team, &state).unwrap()
                })
            })
            .collect();

        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(outcomes.iter().filter(|o| o.claimed).count(), 1);
        assert!(outcomes.iter().all(|o| o.pickup.picked_up));
    }

    assert_eq!(store.count_live_pickups("b"), 0);
    let granted: usize = (0u32..4).map(|team| store.powerups("b", team).len()).sum();
    assert_eq!(granted, 4);
}

#[test]
fn test_powerup_used_once() {
    let store = store();
    let board = EntityPath::game("board").unwrap();
    let state = solved_board();

    let spawned = store
        .spawn_powerups("b", &[(board, &state)], 1, &mut rand::thread_rng())
        .unwrap();
    let outcome = store.claim_pickup("b", spawned[0].id, 0, &state).unwrap();
    let powerup = outcome.powerup.unwrap();

    let barrier = Arc::new(Barrier::new(3));
    let handles: Vec<_> = (0..3)
        .map(|_| {
            let store = store.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                store.use_powerup("b", 0, powerup.id).unwrap()
            })
        })
        .collect();

    let used = handles
        .into_iter()
        .filter_map(|h| h.join().unwrap())
        .count();
    assert_eq!(used, 1);
    assert!(store.powerups("b", 0).is_empty());
}
