//! Convergence properties of the replicated text engine: any two replicas
//! that observe the same operations agree on the text, whatever the
//! delivery order.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use cowrite::{Operation, PosId, Replica, SiteId, SnapshotChar};

fn fresh() -> Replica {
    Replica::new(SiteId::generate())
}

fn apply_all(replica: &mut Replica, ops: &[Operation]) {
    for op in ops {
        replica.apply_remote(op);
    }
}

/// Apply `ops` to a fresh replica in a shuffled order and return the full
/// converged state: live sequence and tombstone set, both order-stable.
fn converge(ops: &[Operation], rng: &mut StdRng) -> (Vec<SnapshotChar>, Vec<PosId>) {
    let mut shuffled: Vec<&Operation> = ops.iter().collect();
    shuffled.shuffle(rng);
    let mut replica = fresh();
    for op in shuffled {
        replica.apply_remote(op);
    }
    replica.check_invariants().unwrap();
    let snapshot = replica.snapshot();
    (snapshot.live_seq, snapshot.tombstones)
}

/// Two replicas editing concurrently with occasional partial delivery, so
/// the recorded history contains deletes of remote characters, pre-emptive
/// tombstones and interleaved inserts.
fn random_history(rng: &mut StdRng, steps: usize) -> Vec<Operation> {
    let mut replicas = [fresh(), fresh()];
    let mut ops: Vec<Operation> = Vec::new();
    // Per replica: how much of `ops` has been delivered to it.
    let mut delivered = [0usize, 0usize];

    for _ in 0..steps {
        let who = rng.random_range(0..2);
        if rng.random_bool(0.7) || replicas[who].is_empty() {
            let index = rng.random_range(0..=replicas[who].len());
            let value = rng.random_range('a'..='z');
            ops.push(replicas[who].local_insert(index, value).unwrap());
        } else {
            let index = rng.random_range(0..replicas[who].len());
            if let Some(op) = replicas[who].local_delete(index) {
                ops.push(op);
            }
        }

        // Occasionally catch a replica up on part of the history.
        if rng.random_bool(0.3) {
            let who = rng.random_range(0..2);
            let until = rng.random_range(delivered[who]..=ops.len());
            for op in &ops[delivered[who]..until] {
                replicas[who].apply_remote(op);
            }
            delivered[who] = until;
        }
    }
    ops
}

#[test]
fn shuffled_schedules_converge_across_size_classes() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for &steps in &[4usize, 12, 32] {
        for round in 0..12 {
            let ops = random_history(&mut rng, steps);
            let reference = converge(&ops, &mut rng);
            // Well over a thousand schedules per size class across rounds.
            for _ in 0..100 {
                let outcome = converge(&ops, &mut rng);
                assert_eq!(
                    outcome, reference,
                    "diverged on {steps}-step history, round {round}"
                );
            }
        }
    }
}

#[test]
fn concurrent_root_inserts_order_deterministically() {
    let mut r1 = fresh();
    let mut r2 = fresh();
    let a = r1.local_insert(0, 'A').unwrap();
    let b = r2.local_insert(0, 'B').unwrap();

    r1.apply_remote(&b);
    r2.apply_remote(&a);
    assert_eq!(r1.text(), r2.text());
    assert_eq!(r1.text().len(), 2);

    // Replaying the same pair onto fresh replicas in both orders lands on
    // the same text again.
    let mut x = fresh();
    let mut y = fresh();
    apply_all(&mut x, &[a.clone(), b.clone()]);
    apply_all(&mut y, &[b, a]);
    assert_eq!(x.text(), r1.text());
    assert_eq!(y.text(), r1.text());
}

#[test]
fn sequential_exchange_builds_hi_bang() {
    let mut r1 = fresh();
    let mut r2 = fresh();
    let h = r1.local_insert(0, 'H').unwrap();
    let i = r1.local_insert(1, 'i').unwrap();
    apply_all(&mut r2, &[h, i]);
    let bang = r2.local_insert(2, '!').unwrap();
    r1.apply_remote(&bang);
    assert_eq!(r1.text(), "Hi!");
    assert_eq!(r2.text(), "Hi!");
}

#[test]
fn delete_of_partially_delivered_text_converges() {
    let mut r1 = fresh();
    let mut r2 = fresh();
    let a = r1.local_insert(0, 'a').unwrap();
    let b = r1.local_insert(1, 'b').unwrap();
    let c = r1.local_insert(2, 'c').unwrap();

    // 'b' is still in flight towards r2.
    r2.apply_remote(&a);
    r2.apply_remote(&c);
    assert_eq!(r2.text(), "ac");
    let del = r2.local_delete(0).unwrap();

    // Everything eventually reaches everyone.
    r2.apply_remote(&b);
    r1.apply_remote(&del);
    assert_eq!(r1.text(), "bc");
    assert_eq!(r2.text(), "bc");
}

#[test]
fn duplicate_delivery_leaves_one_character() {
    let mut r1 = fresh();
    let mut r2 = fresh();
    let q = r1.local_insert(0, 'Q').unwrap();
    r2.apply_remote(&q);
    r2.apply_remote(&q);
    assert_eq!(r2.text(), "Q");
}

#[test]
fn partitioned_bulk_edits_heal_byte_identical() {
    let mut rng = StdRng::seed_from_u64(42);
    let mut r1 = fresh();
    let mut r2 = fresh();
    let mut ops1 = Vec::new();
    let mut ops2 = Vec::new();

    for _ in 0..1000 {
        let index = rng.random_range(0..=r1.len());
        ops1.push(r1.local_insert(index, rng.random_range('a'..='z')).unwrap());
        let index = rng.random_range(0..=r2.len());
        ops2.push(r2.local_insert(index, rng.random_range('A'..='Z')).unwrap());
    }

    // Heal the partition, delivering in independently shuffled orders.
    let mut inbound1 = ops2.clone();
    inbound1.shuffle(&mut rng);
    apply_all(&mut r1, &inbound1);
    let mut inbound2 = ops1.clone();
    inbound2.shuffle(&mut rng);
    apply_all(&mut r2, &inbound2);

    assert_eq!(r1.text(), r2.text());
    assert_eq!(r1.text().chars().count(), 2000);
    r1.check_invariants().unwrap();
    r2.check_invariants().unwrap();
}
