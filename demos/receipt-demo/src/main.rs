//! Receipt Demo: register, verify offline, catch a forked log
//!
//! Shows:
//! 1. A CI builder registers a signed build attestation
//! 2. A consumer verifies the receipt offline
//! 3. A swapped artifact fails verification
//! 4. The log grows and an auditor checks consistency
//! 5. A forked log is caught by the auditor

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use tlog::{
    sign, statement_digest, verify_inclusion, Auditor, InMemoryStorage, LogConfig, LogSigner,
    StatementClaims, TlogError, TransparencyLog, TrustedKeys,
};

const ORIGIN: &str = "demo.example/tlog";

fn attestation(builder: &SigningKey, subject: &str) -> Vec<u8> {
    let claims = StatementClaims {
        issuer: "did:example:ci-builder".into(),
        subject: subject.into(),
        issued_at: 1_700_000_000,
        payload_type: Some("application/vnd.in-toto+json".into()),
        payload_digest: statement_digest(subject.as_bytes()).0.to_vec(),
    };
    sign(&claims, builder).unwrap()
}

fn open_log(seed: &[u8; 32], builder: &SigningKey) -> TransparencyLog<InMemoryStorage> {
    TransparencyLog::open(
        InMemoryStorage::new(),
        LogConfig::new(ORIGIN),
        LogSigner::from_seed(seed),
        TrustedKeys::new().with(builder.verifying_key()),
    )
    .unwrap()
}

fn main() {
    println!("╔════════════════════════════════════════════════╗");
    println!("║  Transparency Log - Receipt Demo               ║");
    println!("║  Append-only, independently verifiable         ║");
    println!("╚════════════════════════════════════════════════╝\n");

    let builder = SigningKey::generate(&mut OsRng);
    let seed = [42u8; 32];
    let log = open_log(&seed, &builder);

    // 1. Register
    println!("📝 Step 1: CI builder registers an attestation");
    println!("   ────────────────────────────────────────────");

    let statement = attestation(&builder, "pkg:cargo/widget@1.0.0");
    let reg = log.register(&statement).unwrap();

    println!("   Statement digest: {}", reg.statement_digest);
    println!("   Leaf index: {}", reg.leaf_index);
    println!("   Tree size: {}", reg.tree_head.claims.tree_size);
    println!("   Root: {}", reg.tree_head.claims.root_hash);
    println!("   Receipt: {} bytes", reg.receipt.len());
    println!("   ✓ Statement logged and receipt issued\n");

    // 2. Verify offline
    println!("🔍 Step 2: Consumer verifies the receipt offline");
    println!("   ─────────────────────────────────────────────");

    let log_key = log.log_key();
    match verify_inclusion(&reg.receipt, &log_key, &statement_digest(&statement)) {
        Ok(v) => {
            println!("   ✓ Receipt signature valid");
            println!("   ✓ Leaf {} included in tree of size {}", v.leaf_index, v.tree_head.tree_size);
        }
        Err(e) => println!("   ✗ Verification failed: {e}"),
    }
    println!();

    // 3. Swapped artifact
    println!("😈 Step 3: Someone swaps in a different attestation");
    println!("   ───────────────────────────────────────────────");

    let swapped = attestation(&builder, "pkg:cargo/widget@1.0.0-backdoored");
    match verify_inclusion(&reg.receipt, &log_key, &statement_digest(&swapped)) {
        Ok(_) => println!("   ✓ Receipt accepted (this should not happen)"),
        Err(e) => {
            println!("   ✗ SWAP DETECTED!");
            println!("   ✗ {e}");
        }
    }
    println!();

    // 4. Growth + consistency
    println!("📈 Step 4: Log grows, auditor checks it only appended");
    println!("   ──────────────────────────────────────────────────");

    let mut auditor = Auditor::new(ORIGIN, log_key);
    let first = log.tree_head().unwrap();
    auditor.observe(&first.envelope, None).unwrap();

    for v in 1..8 {
        log.register(&attestation(&builder, &format!("pkg:cargo/widget@1.{v}.0"))).unwrap();
    }
    let grown = log.tree_head().unwrap();
    let proof = log
        .consistency_proof(first.claims.tree_size, grown.claims.tree_size)
        .unwrap();

    println!("   Old size: {}  New size: {}", first.claims.tree_size, grown.claims.tree_size);
    println!("   Consistency proof: {} hashes", proof.proof_hashes.len());
    match auditor.observe(&grown.envelope, Some(&proof)) {
        Ok(head) => println!("   ✓ Tree of size {} extends the old one", head.tree_size),
        Err(e) => println!("   ✗ {e}"),
    }
    println!();

    // 5. Fork
    println!("🔐 Step 5: A forked log presents a different history");
    println!("   ─────────────────────────────────────────────────");

    let forked = open_log(&seed, &builder);
    forked.register(&statement).unwrap();
    for v in 1..8 {
        forked
            .register(&attestation(&builder, &format!("pkg:cargo/gadget@1.{v}.0")))
            .unwrap();
    }
    let forged = forked.tree_head().unwrap();

    println!("   Honest root: {}", grown.claims.root_hash);
    println!("   Forked root: {}", forged.claims.root_hash);
    match auditor.observe(&forged.envelope, None) {
        Err(TlogError::ForkDetected(reason)) => {
            println!("   ✗ FORK DETECTED!");
            println!("   ✗ {reason}");
            println!("   ✗ Auditor halted: {}", auditor.is_halted());
        }
        other => println!("   ? Unexpected outcome: {other:?}"),
    }
    println!();

    // Summary
    println!("╔════════════════════════════════════════════════╗");
    println!("║  Summary                                       ║");
    println!("╠════════════════════════════════════════════════╣");
    println!("║  ✓ Receipts verify without contacting the log  ║");
    println!("║  ✓ Swapped statements are rejected             ║");
    println!("║  ✓ Consistency proofs show append-only growth  ║");
    println!("║  ✓ Forks are detected and halt the auditor     ║");
    println!("╚════════════════════════════════════════════════╝");
}
