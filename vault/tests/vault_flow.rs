use std::fs;

use keyvault_lib::{
    GateState, KdfParameters, VaultContext, WalletError, WalletKind, WalletOptions, WalletResult,
};
use secrecy::{ExposeSecret, SecretString};
use tempfile::TempDir;

const PASSWORD: &str = "Abcd1234!";

fn secret(value: &str) -> SecretString {
    SecretString::from(value.to_string())
}

fn open_vault(dir: &TempDir) -> WalletResult<VaultContext> {
    let mut context = VaultContext::open_default(dir.path())?;
    context.update_config(|config| {
        config.kdf = KdfParameters::new(8, 1, 1);
        Ok(())
    })?;
    Ok(context)
}

#[test]
fn password_unlock_derive_lock_rehydrate_flow() -> WalletResult<()> {
    let temp_dir = TempDir::new().expect("create temp dir");
    let mut context = open_vault(&temp_dir)?;
    assert!(!context.has_password());

    context.set_password(&secret(PASSWORD))?;
    assert!(context.has_password());
    context.lock();

    assert!(!context.unlock(&secret("wrong"))?);
    assert_eq!(context.state(), GateState::Locked);
    assert!(context.unlock(&secret(PASSWORD))?);
    assert_eq!(context.state(), GateState::Unlocked);

    let group = context.create_seed_group(WalletOptions::new().with_name("Main"))?;
    let derived = context.derive_next(&group)?;
    assert_eq!(context.get_wallet(&derived)?.derivation_index, Some(1));

    let before: Vec<_> = context
        .get_seed_group(&group)?
        .wallets
        .into_iter()
        .map(|w| (w.derivation_index, w.address))
        .collect();
    assert_eq!(before.len(), 2);

    context.lock();
    assert!(context.is_locked());
    assert_eq!(context.derive_next(&group).unwrap_err(), WalletError::Locked);

    assert!(context.unlock(&secret(PASSWORD))?);
    let after: Vec<_> = context
        .get_seed_group(&group)?
        .wallets
        .into_iter()
        .map(|w| (w.derivation_index, w.address))
        .collect();
    assert_eq!(after, before);
    assert_eq!(after[0].0, Some(0));
    assert_eq!(after[1].0, Some(1));
    Ok(())
}

#[test]
fn state_survives_process_restart() -> WalletResult<()> {
    let temp_dir = TempDir::new().expect("create temp dir");
    let (standalone, key) = {
        let mut context = open_vault(&temp_dir)?;
        context.set_password(&secret(PASSWORD))?;
        let id = context.create_standalone(WalletOptions::new())?;
        let key = context.export_private_key(&id)?;
        (id, key)
    };

    let mut reopened = VaultContext::open_default(temp_dir.path())?;
    assert!(reopened.has_password());
    assert!(reopened.is_locked());
    assert!(reopened.metadata_listing().contains_key(&standalone));

    assert!(reopened.unlock(&secret(PASSWORD))?);
    let summary = reopened.get_wallet(&standalone)?;
    assert_eq!(summary.kind, WalletKind::Standalone);

    let err = reopened
        .import_standalone(&key, WalletOptions::new())
        .unwrap_err();
    assert_eq!(err, WalletError::AlreadyExists(standalone.to_string()));
    Ok(())
}

#[test]
fn removing_active_wallets_and_seed_groups() -> WalletResult<()> {
    let temp_dir = TempDir::new().expect("create temp dir");
    let mut context = open_vault(&temp_dir)?;
    context.set_password(&secret(PASSWORD))?;

    let only = context.create_standalone(WalletOptions::new())?;
    assert_eq!(context.active_wallet()?.map(|w| w.id), Some(only.clone()));
    context.remove(&only)?;
    assert!(context.active_wallet()?.is_none());

    let group = context.create_seed_group(WalletOptions::new())?;
    let first = context.list_wallets()?.seed_groups[0].wallets[0].id.clone();
    let second = context.derive_next(&group)?;
    context.remove(&group)?;

    assert!(matches!(context.get_wallet(&first), Err(WalletError::NotFound(_))));
    assert!(matches!(context.get_wallet(&second), Err(WalletError::NotFound(_))));
    assert!(context.active_wallet()?.is_none());
    assert!(context.metadata_listing().is_empty());
    Ok(())
}

#[test]
fn expired_session_file_locks_the_vault() -> WalletResult<()> {
    let temp_dir = TempDir::new().expect("create temp dir");
    let mut context = open_vault(&temp_dir)?;
    context.set_password(&secret(PASSWORD))?;
    let group = context.create_seed_group(WalletOptions::new())?;

    let session_path = context.paths().session_file().to_path_buf();
    let mut session: serde_json::Value = serde_json::from_slice(&fs::read(&session_path)?)?;
    session["expiresAt"] = serde_json::Value::String("2000-01-01T00:00:00Z".to_string());
    fs::write(&session_path, serde_json::to_vec(&session)?)?;

    assert_eq!(context.derive_next(&group).unwrap_err(), WalletError::Locked);
    assert!(context.is_locked());
    assert!(!session_path.exists());
    Ok(())
}

#[test]
fn mnemonic_export_and_reimport_is_detected() -> WalletResult<()> {
    let temp_dir = TempDir::new().expect("create temp dir");
    let mut context = open_vault(&temp_dir)?;
    context.set_password(&secret(PASSWORD))?;

    let group = context.create_seed_group(WalletOptions::new())?;
    let mnemonic = context.export_mnemonic(&group)?;
    assert_eq!(mnemonic.expose_secret().split_whitespace().count(), 12);

    let err = context
        .create_seed_group(WalletOptions::new().with_mnemonic(mnemonic))
        .unwrap_err();
    assert_eq!(err, WalletError::AlreadyExists(group.to_string()));
    Ok(())
}

#[test]
fn broken_metadata_index_does_not_block_wallets() -> WalletResult<()> {
    let temp_dir = TempDir::new().expect("create temp dir");
    let mut context = open_vault(&temp_dir)?;
    context.set_password(&secret(PASSWORD))?;
    let existing = context.create_standalone(WalletOptions::new())?;

    let metadata_file = context.paths().metadata_file().to_path_buf();
    fs::remove_file(&metadata_file).expect("remove metadata index");
    fs::create_dir(&metadata_file).expect("put a directory in its place");

    let created = context.create_standalone(WalletOptions::new())?;
    let group = context.create_seed_group(WalletOptions::new())?;
    let derived = context.derive_next(&group)?;
    assert_eq!(context.wallets()?.len(), 4);

    context.lock();
    assert!(context.unlock(&secret(PASSWORD))?);
    assert!(context
        .last_rehydration()
        .map_or(false, |report| report.is_complete()));
    for id in [&existing, &created, &derived] {
        context.get_wallet(id)?;
    }
    assert!(context.metadata_listing().is_empty());
    Ok(())
}

#[test]
fn hand_edited_config_falls_back_to_defaults() -> WalletResult<()> {
    let temp_dir = TempDir::new().expect("create temp dir");
    {
        let mut context = open_vault(&temp_dir)?;
        context.set_password(&secret(PASSWORD))?;
        context.create_standalone(WalletOptions::new())?;
    }

    let config_file = temp_dir.path().join("config.json");
    let raw = fs::read_to_string(&config_file).expect("read config");
    assert!(raw.contains("\"timeoutMinutes\": 15"));
    fs::write(
        &config_file,
        raw.replace("\"timeoutMinutes\": 15", "\"timeoutMinutes\": 30"),
    )
    .expect("edit config");

    let mut reopened = VaultContext::open_default(temp_dir.path())?;
    assert_eq!(reopened.config().session.timeout_minutes, 15);
    assert!(reopened.unlock(&secret(PASSWORD))?);
    assert_eq!(reopened.wallets()?.len(), 1);
    Ok(())
}

#[test]
fn unlock_backoff_survives_restart() -> WalletResult<()> {
    let temp_dir = TempDir::new().expect("create temp dir");
    {
        let mut context = open_vault(&temp_dir)?;
        context.set_password(&secret(PASSWORD))?;
        context.lock();
        for _ in 0..4 {
            assert!(!context.unlock(&secret("Wrong1234!"))?);
        }
    }

    let mut reopened = VaultContext::open_default(temp_dir.path())?;
    assert!(matches!(
        reopened.unlock(&secret(PASSWORD)),
        Err(WalletError::PermissionDenied(_))
    ));
    assert!(reopened.is_locked());
    Ok(())
}
