//! End-to-end tests for the MFA service over in-memory stores.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use keystep::testing::{CapturingAuditSink, InMemoryFailureLedger, InMemorySettingsStore};
use keystep::{
    BackupCodeGenerator, MasterKey, MfaConfig, MfaError, MfaService, MfaState, RateLimitPolicy,
    SettingsStore, VerifyMethod,
};

type TestService = MfaService<InMemorySettingsStore, InMemoryFailureLedger, CapturingAuditSink>;

struct Harness {
    service: TestService,
    settings: InMemorySettingsStore,
    ledger: InMemoryFailureLedger,
    audit: CapturingAuditSink,
}

fn harness_with(config: MfaConfig) -> Harness {
    let settings = InMemorySettingsStore::new();
    let ledger = InMemoryFailureLedger::new();
    let audit = CapturingAuditSink::new();
    let service = MfaService::new(
        MasterKey::from_bytes([42u8; 32]),
        config,
        settings.clone(),
        ledger.clone(),
        audit.clone(),
    );
    Harness {
        service,
        settings,
        ledger,
        audit,
    }
}

fn harness() -> Harness {
    harness_with(MfaConfig::new("TestApp"))
}

/// Set up and enable MFA for the account, returning the raw seed and the
/// plaintext backup codes (display form).
async fn enroll(h: &Harness, account_id: &str) -> (Vec<u8>, Vec<String>) {
    let setup = h.service.setup(account_id).await.unwrap();
    let seed = h.service.totp().decode_seed(&setup.seed_base32).unwrap();
    let code = h
        .service
        .totp()
        .current_code(&seed, SystemTime::now())
        .unwrap();
    assert!(h.service.enable(account_id, &code).await.unwrap());
    (seed, setup.backup_codes)
}

fn current_code(h: &Harness, seed: &[u8]) -> String {
    h.service
        .totp()
        .current_code(seed, SystemTime::now())
        .unwrap()
}

/// A six-digit code guaranteed not to verify for this seed, even across the
/// skew window and some clock movement while the test runs.
fn wrong_code(h: &Harness, seed: &[u8]) -> String {
    let now = SystemTime::now();
    let valid: Vec<String> = (0..6)
        .map(|i| {
            let t = now - Duration::from_secs(60) + Duration::from_secs(30 * i);
            h.service.totp().current_code(seed, t).unwrap()
        })
        .collect();
    (0..)
        .map(|n| format!("{n:06}"))
        .find(|candidate| !valid.contains(candidate))
        .unwrap()
}

#[tokio::test]
async fn setup_and_enable_scenario() {
    let h = harness();

    let setup = h.service.setup("u1").await.unwrap();
    assert!(setup.provisioning_uri.starts_with("otpauth://totp/"));
    assert!(setup.provisioning_uri.contains("issuer=TestApp"));
    assert_eq!(setup.backup_codes.len(), 10);

    let status = h.service.status("u1").await.unwrap();
    assert_eq!(status.state, MfaState::Pending);
    assert!(!status.enabled());

    let seed = h.service.totp().decode_seed(&setup.seed_base32).unwrap();
    let code = current_code(&h, &seed);
    assert!(h.service.enable("u1", &code).await.unwrap());

    let status = h.service.status("u1").await.unwrap();
    assert_eq!(status.state, MfaState::Enabled);
    assert_eq!(status.backup_codes_remaining, 10);

    assert_eq!(
        h.audit.names(),
        vec!["mfa_setup_initiated", "mfa_setup_completed"]
    );
}

#[tokio::test]
async fn enable_with_wrong_code_stays_pending() {
    let h = harness();
    let setup = h.service.setup("u1").await.unwrap();
    let seed = h.service.totp().decode_seed(&setup.seed_base32).unwrap();

    assert!(!h.service.enable("u1", &wrong_code(&h, &seed)).await.unwrap());
    assert_eq!(h.service.status("u1").await.unwrap().state, MfaState::Pending);
    assert_eq!(h.ledger.all().len(), 1);
}

#[tokio::test]
async fn enable_rejects_malformed_code_without_side_effects() {
    let h = harness();
    h.service.setup("u1").await.unwrap();

    // Not a TOTP shape: rejected outright, no failure record, no audit noise.
    assert!(matches!(
        h.service.enable("u1", "12345a").await,
        Err(MfaError::InvalidInput(_))
    ));
    assert!(h.ledger.all().is_empty());
    assert_eq!(h.audit.names(), vec!["mfa_setup_initiated"]);
    assert_eq!(h.service.status("u1").await.unwrap().state, MfaState::Pending);
}

#[tokio::test]
async fn verify_with_totp() {
    let h = harness();
    let (seed, _) = enroll(&h, "u1").await;

    let outcome = h
        .service
        .verify("u1", &current_code(&h, &seed), Some("203.0.113.9"))
        .await
        .unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.method, VerifyMethod::Totp);
    assert!(outcome.backup_codes_remaining.is_none());

    let rejected = h
        .service
        .verify("u1", &wrong_code(&h, &seed), Some("203.0.113.9"))
        .await
        .unwrap();
    assert!(!rejected.success);
    assert_eq!(rejected.method, VerifyMethod::Totp);

    let records = h.ledger.all();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].source_ip.as_deref(), Some("203.0.113.9"));
    assert!(h.audit.names().contains(&"mfa_verification_success"));
    assert!(h.audit.names().contains(&"mfa_verification_failed"));
}

#[tokio::test]
async fn verify_with_backup_code() {
    let h = harness();
    let (_, codes) = enroll(&h, "u1").await;

    // Display form (with dashes) is accepted as submitted.
    let outcome = h.service.verify("u1", &codes[0], None).await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.method, VerifyMethod::BackupCode);
    assert_eq!(outcome.backup_codes_remaining, Some(9));
    assert!(!outcome.low_backup_codes());

    // Single use: the same code never works twice.
    let again = h.service.verify("u1", &codes[0], None).await.unwrap();
    assert!(!again.success);
    assert_eq!(again.method, VerifyMethod::BackupCode);

    assert_eq!(h.service.status("u1").await.unwrap().backup_codes_remaining, 9);
    assert!(h.audit.names().contains(&"mfa_backup_code_used"));
}

#[tokio::test]
async fn backup_code_exhaustion() {
    let h = harness();
    let (_, codes) = enroll(&h, "u1").await;

    for (i, code) in codes.iter().enumerate() {
        let outcome = h.service.verify("u1", code, None).await.unwrap();
        assert!(outcome.success, "code {i} should consume once");
        assert_eq!(outcome.backup_codes_remaining, Some(codes.len() - i - 1));
    }

    let last = h.service.status("u1").await.unwrap();
    assert_eq!(last.backup_codes_remaining, 0);

    for code in &codes {
        let outcome = h.service.verify("u1", code, None).await.unwrap();
        assert!(!outcome.success);
    }
}

#[tokio::test]
async fn lockout_threshold_blocks_even_correct_codes() {
    let h = harness();
    let (seed, _) = enroll(&h, "u1").await;

    let wrong = wrong_code(&h, &seed);
    for _ in 0..5 {
        let outcome = h.service.verify("u1", &wrong, None).await.unwrap();
        assert!(!outcome.success);
    }

    // The sixth attempt is rejected before any code comparison: even the
    // correct code fails while locked.
    let locked = h.service.verify("u1", &current_code(&h, &seed), None).await;
    match locked {
        Err(MfaError::RateLimited { retry_after }) => {
            assert!(retry_after > Duration::from_secs(0));
            assert!(retry_after <= Duration::from_secs(15 * 60));
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }

    assert!(h.audit.names().contains(&"mfa_rate_limited"));
    // The locked attempt appended a rate_limited record, not another invalid-code one.
    assert_eq!(h.ledger.all().len(), 6);
}

#[tokio::test]
async fn locked_account_is_rejected_before_storage_access() {
    let h = harness();
    let (seed, _) = enroll(&h, "u1").await;

    let wrong = wrong_code(&h, &seed);
    for _ in 0..5 {
        assert!(!h.service.verify("u1", &wrong, None).await.unwrap().success);
    }

    // While locked, verification never reaches the settings store, so no
    // decryption or code comparison can happen either.
    let loads_before = h.settings.load_count();
    assert!(matches!(
        h.service.verify("u1", &current_code(&h, &seed), None).await,
        Err(MfaError::RateLimited { .. })
    ));
    assert_eq!(h.settings.load_count(), loads_before);
}

#[tokio::test]
async fn lockout_expires_then_correct_code_succeeds() {
    let h = harness_with(
        MfaConfig::new("TestApp")
            .rate_limit(RateLimitPolicy::new().lockout(Duration::from_millis(300))),
    );
    let (seed, _) = enroll(&h, "u1").await;

    let wrong = wrong_code(&h, &seed);
    for _ in 0..5 {
        assert!(!h.service.verify("u1", &wrong, None).await.unwrap().success);
    }
    assert!(matches!(
        h.service.verify("u1", &current_code(&h, &seed), None).await,
        Err(MfaError::RateLimited { .. })
    ));

    tokio::time::sleep(Duration::from_millis(400)).await;

    let outcome = h
        .service
        .verify("u1", &current_code(&h, &seed), None)
        .await
        .unwrap();
    assert!(outcome.success);
}

#[tokio::test]
async fn success_resets_failure_history() {
    let h = harness();
    let (seed, _) = enroll(&h, "u1").await;
    let wrong = wrong_code(&h, &seed);

    for _ in 0..3 {
        assert!(!h.service.verify("u1", &wrong, None).await.unwrap().success);
    }
    assert!(h
        .service
        .verify("u1", &current_code(&h, &seed), None)
        .await
        .unwrap()
        .success);
    assert!(h.ledger.all().is_empty());

    // Five new failures are required to lock, not two more.
    for _ in 0..4 {
        assert!(!h.service.verify("u1", &wrong, None).await.unwrap().success);
    }
    let outcome = h
        .service
        .verify("u1", &current_code(&h, &seed), None)
        .await
        .unwrap();
    assert!(outcome.success);
}

#[tokio::test]
async fn decrypt_failure_is_isolated_per_account() {
    let h = harness();
    let (_, _) = enroll(&h, "u1").await;
    let (seed2, _) = enroll(&h, "u2").await;

    // Corrupt u1's stored envelope directly in the store.
    let mut record = h.settings.load("u1").await.unwrap().unwrap();
    let last = record.encrypted_secret.ciphertext.len() - 1;
    record.encrypted_secret.ciphertext[last] ^= 0xFF;
    h.settings.put(record);

    let code1 = current_code(&h, &seed2); // any six digits reach decryption
    assert!(matches!(
        h.service.verify("u1", &code1, None).await,
        Err(MfaError::Decrypt)
    ));

    // u2 is unaffected.
    let outcome = h
        .service
        .verify("u2", &current_code(&h, &seed2), None)
        .await
        .unwrap();
    assert!(outcome.success);

    // The decrypt failure left no failure record for u1.
    assert!(h.ledger.all().iter().all(|r| r.account_id != "u1"));
}

#[tokio::test]
async fn regeneration_replaces_the_batch() {
    let h = harness();
    let (_, old_codes) = enroll(&h, "u1").await;

    let new_codes = h.service.regenerate_backup_codes("u1").await.unwrap();
    assert_eq!(new_codes.len(), 10);

    // Old codes are permanently invalid.
    let outcome = h.service.verify("u1", &old_codes[0], None).await.unwrap();
    assert!(!outcome.success);

    // New codes work.
    let outcome = h.service.verify("u1", &new_codes[0], None).await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.backup_codes_remaining, Some(9));

    assert!(h.audit.names().contains(&"mfa_backup_codes_regenerated"));
}

#[tokio::test]
async fn low_code_warning_surfaces() {
    let h = harness_with(
        MfaConfig::new("TestApp").backup_codes(BackupCodeGenerator::new().with_count(3)),
    );
    let (_, codes) = enroll(&h, "u1").await;

    let outcome = h.service.verify("u1", &codes[0], None).await.unwrap();
    assert_eq!(outcome.backup_codes_remaining, Some(2));
    assert!(outcome.low_backup_codes());
    assert!(!outcome.backup_codes_exhausted());

    h.service.verify("u1", &codes[1], None).await.unwrap();
    let outcome = h.service.verify("u1", &codes[2], None).await.unwrap();
    assert!(outcome.backup_codes_exhausted());
}

#[tokio::test]
async fn persistence_outage_fails_closed() {
    let h = harness();
    let (seed, _) = enroll(&h, "u1").await;
    let code = current_code(&h, &seed);

    h.settings.set_unavailable(true);
    match h.service.verify("u1", &code, None).await {
        Err(MfaError::Persistence(_)) => {}
        other => panic!("expected Persistence error, got {other:?}"),
    }

    h.settings.set_unavailable(false);
    assert!(h.service.verify("u1", &code, None).await.unwrap().success);
}

#[tokio::test]
async fn concurrent_backup_submissions_consume_once() {
    let h = harness();
    let (_, codes) = enroll(&h, "u1").await;
    let service = Arc::new(h.service);
    let code = codes[0].clone();

    let tasks: Vec<_> = (0..2)
        .map(|_| {
            let service = Arc::clone(&service);
            let code = code.clone();
            tokio::spawn(async move { service.verify("u1", &code, None).await.unwrap() })
        })
        .collect();

    let mut successes = 0;
    for task in tasks {
        if task.await.unwrap().success {
            successes += 1;
        }
    }
    assert_eq!(successes, 1, "a backup code must consume exactly once");
}

#[tokio::test]
async fn status_for_unknown_account() {
    let h = harness();
    let status = h.service.status("nobody").await.unwrap();
    assert_eq!(status.state, MfaState::Disabled);
    assert_eq!(status.backup_codes_remaining, 0);
}
