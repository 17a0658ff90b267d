// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

test_r::enable!();

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bazaar_common::config::DbSqliteConfig;
use bazaar_common::model::{
    DefaultPermission, JobStatus, LogLevel, ModelAccess, ModelId, ModelPermission,
};
use bazaar_service::api::ApiError;
use bazaar_service::auth::{
    ApiKeySecret, Authorisation, JobAuthorisation, JobTokenRole, PlatformApiKey,
    PlatformSecurityScheme,
};
use bazaar_service::bootstrap::Services;
use bazaar_service::config::PlatformServiceConfig;
use bazaar_service::identity::IdentityError;
use bazaar_service::license::{LicenseClaims, LicenseError, LicenseVerifier};
use bazaar_service::model::{
    CreateApiKeyRequest, CreateCompositeRequest, DeployRequest, FileDescriptor, FileLocation,
    JobOptions, LogSource, SignupRequest, StartModelUploadRequest, TrainNdbRequest, User,
    WorkerStatus,
};
use bazaar_service::orchestrator::in_process::InProcessOrchestrator;
use bazaar_service::orchestrator::{
    deploy_job_name, train_job_name, JobState, OrchestratorClient,
};
use bazaar_service::repo::api_key::{ApiKeyRecord, DbApiKeyRepo};
use bazaar_service::repo::model::{DbModelRepo, ModelRepo};
use bazaar_service::service::auth::{hash_api_key_secret, AuthServiceError};
use bazaar_service::service::deploy::DeployError;
use bazaar_service::service::model::ModelError;
use bazaar_service::service::model_upload::ModelUploadError;
use bazaar_service::service::train::TrainError;
use bazaar_service::service::user::UserError;
use bazaar_service_base::db;
use bazaar_service_base::db::sqlite::SqlitePool;
use bazaar_service_base::migration::{IncludedMigrationsDir, Migrations};
use bazaar_service_base::storage::memory::InMemoryObjectStore;
use bazaar_service_base::storage::ObjectStore;
use chrono::{Duration as ChronoDuration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use test_r::test;
use uuid::Uuid;

// Fixed Ed25519 keypair (PKCS#8 private, SPKI public) used only by tests.
const TEST_PRIVATE_KEY: &str = "MC4CAQAwBQYDK2VwBCIEIMDNO+xRAwWTDqt5wN84sCHviRldQMiylmSK715b5JnW";
const TEST_PUBLIC_KEY: &str = "MCowBQYDK2VwAyEA9gxANNtlWPBBTm0IEgvMgCEUXw+ohwffyM9wOL4O1pg=";

fn sign_license(claims: &LicenseClaims) -> String {
    let der = BASE64.decode(TEST_PRIVATE_KEY).expect("valid test key");
    let key = EncodingKey::from_ed_der(&der);
    jsonwebtoken::encode(&Header::new(Algorithm::EdDSA), claims, &key).expect("license signing")
}

struct TestContext {
    services: Services,
    orchestrator: Arc<InProcessOrchestrator>,
    object_store: Arc<dyn ObjectStore>,
    model_repo: Arc<dyn ModelRepo>,
    api_key_repo: Arc<DbApiKeyRepo<SqlitePool>>,
    _temp: tempfile::TempDir,
}

async fn make_context() -> TestContext {
    make_context_with_cpu_limit(1_000_000).await
}

async fn make_context_with_cpu_limit(cpu_mhz_limit: u64) -> TestContext {
    let temp = tempfile::tempdir().expect("temp dir");
    let db_config = DbSqliteConfig {
        database: temp.path().join("bazaar.sqlite"),
        max_connections: 4,
    };

    let migrations =
        IncludedMigrationsDir::new(&bazaar_service::DB_MIGRATIONS).expect("migrations");
    db::sqlite::migrate(&db_config, &migrations.sqlite_migrations())
        .await
        .expect("sqlite migration");
    let pool = SqlitePool::configured(&db_config).await.expect("pool");

    let orchestrator = Arc::new(InProcessOrchestrator::new("localhost"));
    let object_store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());

    let claims = LicenseClaims {
        cpu_mhz_limit,
        exp: (Utc::now() + ChronoDuration::days(365)).timestamp(),
        payload: "license-payload".to_string(),
    };
    let license = Arc::new(
        LicenseVerifier::from_token(
            &sign_license(&claims),
            TEST_PUBLIC_KEY,
            orchestrator.clone(),
        )
        .expect("test license"),
    );

    let mut config = PlatformServiceConfig::default();
    config.jwt_secret = "test-jwt-secret".to_string();
    // tests tick the reconciliation loop manually and want immediate effect
    config.job_sync.grace = Duration::from_secs(0);

    let services = Services::make_with_db(
        &config,
        pool.clone(),
        object_store.clone(),
        orchestrator.clone(),
        license,
    )
    .await
    .expect("services");

    TestContext {
        services,
        orchestrator,
        object_store,
        model_repo: Arc::new(DbModelRepo::new(pool.clone())),
        api_key_repo: Arc::new(DbApiKeyRepo::new(pool)),
        _temp: temp,
    }
}

async fn signup(ctx: &TestContext, name: &str) -> (User, Authorisation) {
    let user = ctx
        .services
        .user_service
        .signup(&SignupRequest {
            username: name.to_string(),
            email: format!("{name}@example.com"),
            password: "secret-password".to_string(),
        })
        .await
        .expect("signup");
    (user.clone(), Authorisation::for_user(user, None))
}

async fn signup_admin(ctx: &TestContext, name: &str) -> Authorisation {
    let user = ctx
        .services
        .identity
        .create_user(name, &format!("{name}@example.com"), Some("pw"), true)
        .await
        .expect("admin user");
    Authorisation::for_user(user, None)
}

fn local_data() -> Vec<FileDescriptor> {
    vec![FileDescriptor {
        path: "/srv/datasets/sample.csv".to_string(),
        location: FileLocation::Local,
        source_id: None,
        options: HashMap::new(),
        metadata: HashMap::new(),
    }]
}

async fn train_ndb(ctx: &TestContext, auth: &Authorisation, name: &str) -> ModelId {
    ctx.services
        .train_service
        .train_ndb(
            auth,
            &TrainNdbRequest {
                model_name: name.to_string(),
                data: local_data(),
                model_options: HashMap::new(),
                job_options: JobOptions::default(),
            },
        )
        .await
        .expect("train submission")
        .model_id
}

fn train_job_auth(model_id: ModelId) -> JobAuthorisation {
    JobAuthorisation {
        model_id,
        role: JobTokenRole::Train,
    }
}

fn deploy_job_auth(model_id: ModelId) -> JobAuthorisation {
    JobAuthorisation {
        model_id,
        role: JobTokenRole::Deploy,
    }
}

async fn worker_completes_training(ctx: &TestContext, model_id: ModelId) {
    ctx.services
        .train_service
        .update_status(&train_job_auth(model_id), WorkerStatus::Complete)
        .await
        .expect("status update");
}

// --- S1: user lifecycle ---------------------------------------------------

#[test]
async fn user_signup_login_and_info() {
    let ctx = make_context().await;

    let (alice, _) = signup(&ctx, "alice").await;
    assert_eq!(alice.username, "alice");
    assert!(!alice.is_admin);

    let tokens = ctx
        .services
        .user_service
        .login(&bazaar_service::model::LoginRequest {
            email: "alice@example.com".to_string(),
            password: "secret-password".to_string(),
        })
        .await
        .expect("login");
    assert!(!tokens.access_token.is_empty());

    let fetched = ctx.services.user_service.get(&alice.id).await.expect("get");
    assert_eq!(fetched, alice);

    // duplicate signup fails before any side effect
    let duplicate = ctx
        .services
        .user_service
        .signup(&SignupRequest {
            username: "alice".to_string(),
            email: "alice@example.com".to_string(),
            password: "other".to_string(),
        })
        .await;
    assert!(matches!(
        duplicate,
        Err(UserError::Identity(IdentityError::UsernameAlreadyInUse(_)))
    ));

    let wrong_password = ctx
        .services
        .user_service
        .login(&bazaar_service::model::LoginRequest {
            email: "alice@example.com".to_string(),
            password: "wrong".to_string(),
        })
        .await;
    assert!(matches!(
        wrong_password,
        Err(UserError::Identity(IdentityError::InvalidCredentials))
    ));
}

// --- property 1: name uniqueness ------------------------------------------

#[test]
async fn model_names_are_unique_per_owner() {
    let ctx = make_context().await;
    let (_, alice) = signup(&ctx, "alice").await;
    let (_, bob) = signup(&ctx, "bob").await;

    train_ndb(&ctx, &alice, "search").await;

    let duplicate = ctx
        .services
        .train_service
        .train_ndb(
            &alice,
            &TrainNdbRequest {
                model_name: "search".to_string(),
                data: local_data(),
                model_options: HashMap::new(),
                job_options: JobOptions::default(),
            },
        )
        .await;
    assert!(matches!(duplicate, Err(TrainError::DuplicateName(_))));
    assert!(matches!(
        ApiError::from(duplicate.unwrap_err()),
        ApiError::Unprocessable(_)
    ));

    // a different owner may reuse the name
    train_ndb(&ctx, &bob, "search").await;
}

// --- S2: train → reconciliation sync --------------------------------------

#[test]
async fn reconciliation_marks_lost_jobs_failed() {
    let ctx = make_context().await;
    let (_, alice) = signup(&ctx, "alice").await;

    let model_id = train_ndb(&ctx, &alice, "lost-job").await;
    let status = ctx
        .services
        .train_service
        .status(&model_id)
        .await
        .expect("status");
    assert_eq!(status.status, JobStatus::Starting);

    // the worker got one warning out before the orchestrator lost the job
    ctx.services
        .train_service
        .append_log(
            &train_job_auth(model_id),
            LogLevel::Warning,
            "low disk space",
        )
        .await
        .expect("worker log");

    ctx.orchestrator.clear().await;
    ctx.services
        .job_status_sync
        .sync_once()
        .await
        .expect("sync tick");

    let status = ctx
        .services
        .train_service
        .status(&model_id)
        .await
        .expect("status");
    assert_eq!(status.status, JobStatus::Failed);

    let logs = ctx
        .services
        .train_service
        .logs(&model_id)
        .await
        .expect("logs");
    let worker_lines: Vec<_> = logs
        .logs
        .iter()
        .filter(|line| line.source == LogSource::Worker)
        .collect();
    assert!(worker_lines
        .iter()
        .any(|line| line.message.contains("low disk space")));
    assert!(worker_lines.iter().any(|line| {
        line.level == Some(LogLevel::Error) && line.message.contains("orchestrator reports")
    }));
}

#[test]
async fn reconciliation_leaves_running_jobs_alone() {
    let ctx = make_context().await;
    let (_, alice) = signup(&ctx, "alice").await;

    let model_id = train_ndb(&ctx, &alice, "still-running").await;
    ctx.services
        .job_status_sync
        .sync_once()
        .await
        .expect("sync tick");

    let status = ctx
        .services
        .train_service
        .status(&model_id)
        .await
        .expect("status");
    assert_eq!(status.status, JobStatus::Starting);
}

// --- S3: permission matrix -------------------------------------------------

#[test]
async fn public_access_and_default_permission_matrix() {
    let ctx = make_context().await;
    let (_, owner) = signup(&ctx, "owner").await;
    let (_, other) = signup(&ctx, "other").await;

    let model_id = train_ndb(&ctx, &owner, "shared").await;
    let record = ctx
        .services
        .model_service
        .get_record(&model_id)
        .await
        .expect("record");

    let permission = ctx
        .services
        .auth_service
        .get_model_permission(&other, &record)
        .await
        .expect("permission");
    assert_eq!(permission, ModelPermission::None);

    ctx.services
        .model_service
        .set_access(&model_id, ModelAccess::Public, None)
        .await
        .expect("set public");
    let record = ctx
        .services
        .model_service
        .get_record(&model_id)
        .await
        .expect("record");
    let permission = ctx
        .services
        .auth_service
        .get_model_permission(&other, &record)
        .await
        .expect("permission");
    assert_eq!(permission, ModelPermission::Read);

    ctx.services
        .model_service
        .set_default_permission(&model_id, DefaultPermission::Write)
        .await
        .expect("set write");
    let record = ctx
        .services
        .model_service
        .get_record(&model_id)
        .await
        .expect("record");
    let permission = ctx
        .services
        .auth_service
        .get_model_permission(&other, &record)
        .await
        .expect("permission");
    assert_eq!(permission, ModelPermission::Write);

    // the owner never drops below owner
    let permission = ctx
        .services
        .auth_service
        .get_model_permission(&owner, &record)
        .await
        .expect("permission");
    assert_eq!(permission, ModelPermission::Owner);
}

#[test]
async fn team_membership_grants_and_revokes_access() {
    let ctx = make_context().await;
    let (_, owner) = signup(&ctx, "owner").await;
    let (member_user, member) = signup(&ctx, "member").await;

    let team = ctx
        .services
        .team_service
        .create("search-team")
        .await
        .expect("team");
    ctx.services
        .team_service
        .add_user(&team.id, &member_user.id)
        .await
        .expect("add member");

    let model_id = train_ndb(&ctx, &owner, "team-model").await;
    ctx.services
        .team_service
        .attach_model(&team.id, &model_id)
        .await
        .expect("attach");

    let record = ctx
        .services
        .model_service
        .get_record(&model_id)
        .await
        .expect("record");
    assert_eq!(record.access, ModelAccess::Protected.as_str());
    assert_eq!(record.team_id, Some(team.id.0));

    let permission = ctx
        .services
        .auth_service
        .get_model_permission(&member, &record)
        .await
        .expect("permission");
    assert_eq!(permission, ModelPermission::Read);

    // team admins own the team's models
    ctx.services
        .team_service
        .set_team_admin(&team.id, &member_user.id, true)
        .await
        .expect("promote");
    let permission = ctx
        .services
        .auth_service
        .get_model_permission(&member, &record)
        .await
        .expect("permission");
    assert_eq!(permission, ModelPermission::Owner);

    // removing the owner from the team resets their team models to private
    ctx.services
        .team_service
        .add_user(&team.id, &owner.user.id)
        .await
        .expect("add owner");
    ctx.services
        .team_service
        .remove_user(&team.id, &owner.user.id)
        .await
        .expect("remove owner");
    let record = ctx
        .services
        .model_service
        .get_record(&model_id)
        .await
        .expect("record");
    assert_eq!(record.access, ModelAccess::Private.as_str());
    assert_eq!(record.team_id, None);
}

// --- S4: composite status rollup -------------------------------------------

#[test]
async fn composite_status_follows_dependencies() {
    let ctx = make_context().await;
    let (_, alice) = signup(&ctx, "alice").await;

    let ndb = train_ndb(&ctx, &alice, "retrieval").await;
    let nlp = ctx
        .services
        .train_service
        .train_nlp(
            &alice,
            bazaar_common::model::ModelType::NlpToken,
            &bazaar_service::model::TrainNlpRequest {
                model_name: "guardrail".to_string(),
                data: local_data(),
                model_options: HashMap::new(),
                job_options: JobOptions::default(),
            },
        )
        .await
        .expect("nlp training")
        .model_id;

    let composite = ctx
        .services
        .train_service
        .create_composite(
            &alice,
            bazaar_common::model::ModelType::EnterpriseSearch,
            &CreateCompositeRequest {
                model_name: "enterprise".to_string(),
                dependency_ids: vec![ndb, nlp],
            },
        )
        .await
        .expect("composite")
        .model_id;

    // both dependencies are starting
    let status = ctx
        .services
        .train_service
        .status(&composite)
        .await
        .expect("status");
    assert_eq!(status.status, JobStatus::Starting);

    // one failed dependency fails the composite
    ctx.services
        .train_service
        .update_status(&train_job_auth(ndb), WorkerStatus::Failed)
        .await
        .expect("fail ndb");
    let status = ctx
        .services
        .train_service
        .status(&composite)
        .await
        .expect("status");
    assert_eq!(status.status, JobStatus::Failed);

    // a repaired run completes both dependencies; the rollup is pure
    // read-time state
    ctx.model_repo
        .update_train_status(&ndb.0, &[JobStatus::Failed], JobStatus::Complete)
        .await
        .expect("repair ndb");
    worker_completes_training(&ctx, nlp).await;

    let status = ctx
        .services
        .train_service
        .status(&composite)
        .await
        .expect("status");
    assert_eq!(status.status, JobStatus::Complete);
}

// --- S5: API key scope, expiry, revocation ---------------------------------

#[test]
async fn api_key_scope_expiry_and_revocation() {
    let ctx = make_context().await;
    let (_, owner) = signup(&ctx, "owner").await;

    let m1 = train_ndb(&ctx, &owner, "m1").await;
    let m2 = train_ndb(&ctx, &owner, "m2").await;

    let created = ctx
        .services
        .api_key_service
        .create(
            &owner,
            &m1,
            &CreateApiKeyRequest {
                name: "reader".to_string(),
                expires_at: Utc::now() + ChronoDuration::hours(24),
                model_ids: vec![],
                all_models: false,
            },
        )
        .await
        .expect("api key");
    assert!(created.key.starts_with("bzk-"));

    let scheme = |key: &str| {
        PlatformSecurityScheme::ApiKey(PlatformApiKey(ApiKeySecret {
            value: key.to_string(),
        }))
    };

    let auth = ctx
        .services
        .auth_service
        .authorization(scheme(&created.key))
        .await
        .expect("api key auth");
    assert!(auth.is_api_key());

    let m1_record = ctx.services.model_service.get_record(&m1).await.unwrap();
    let m2_record = ctx.services.model_service.get_record(&m2).await.unwrap();

    ctx.services
        .auth_service
        .ensure_model_permission(&auth, &m1_record, ModelPermission::Read)
        .await
        .expect("m1 read");

    let mismatch = ctx
        .services
        .auth_service
        .ensure_model_permission(&auth, &m2_record, ModelPermission::Read)
        .await;
    assert!(matches!(
        mismatch,
        Err(AuthServiceError::ApiKeyModelMismatch(_))
    ));
    assert!(matches!(
        ApiError::from(mismatch.unwrap_err()),
        ApiError::Forbidden(_)
    ));

    // keys never unlock writes
    let write = ctx
        .services
        .auth_service
        .ensure_model_permission(&auth, &m1_record, ModelPermission::Write)
        .await;
    assert!(matches!(write, Err(AuthServiceError::ApiKeyNotAllowed(_))));

    // an expired key is rejected with its own error
    use bazaar_service::repo::api_key::ApiKeyRepo;
    let expired_secret = "expired-secret-value";
    ctx.api_key_repo
        .create(
            &ApiKeyRecord {
                id: Uuid::new_v4(),
                hashed_secret: hash_api_key_secret(expired_secret),
                created_by: owner.user.id.0,
                name: "stale".to_string(),
                expires_at: Utc::now() - ChronoDuration::hours(1),
                all_models: true,
            },
            &[],
        )
        .await
        .expect("expired key row");
    let expired = ctx
        .services
        .auth_service
        .authorization(scheme(&format!("bzk-{expired_secret}")))
        .await;
    assert!(matches!(expired, Err(AuthServiceError::ApiKeyExpired)));
    assert!(matches!(
        ApiError::from(expired.unwrap_err()),
        ApiError::Forbidden(_)
    ));

    // a deleted key is indistinguishable from an unknown one
    ctx.services
        .api_key_service
        .delete(&owner, &created.data.id)
        .await
        .expect("delete key");
    let deleted = ctx
        .services
        .auth_service
        .authorization(scheme(&created.key))
        .await;
    assert!(matches!(deleted, Err(AuthServiceError::InvalidApiKey)));
    assert!(matches!(
        ApiError::from(deleted.unwrap_err()),
        ApiError::Unauthorized(_)
    ));
}

// --- property 4: upload integrity ------------------------------------------

#[test]
async fn chunked_upload_commits_with_matching_checksum() {
    let ctx = make_context().await;
    let (_, alice) = signup(&ctx, "alice").await;

    let payload = b"hello chunked world".to_vec();
    let checksum = hex::encode(Sha256::digest(&payload));

    let started = ctx
        .services
        .model_upload_service
        .start(
            &alice,
            &StartModelUploadRequest {
                model_name: "uploaded".to_string(),
                model_type: bazaar_common::model::ModelType::Ndb,
                checksum: Some(checksum.clone()),
            },
        )
        .await
        .expect("start upload");
    assert!(!started.upload_token.is_empty());

    let job = JobAuthorisation {
        model_id: started.model_id,
        role: JobTokenRole::Upload,
    };

    for (idx, chunk) in payload.chunks(7).enumerate() {
        let bytes = bytes::Bytes::copy_from_slice(chunk);
        ctx.services
            .model_upload_service
            .put_chunk(
                &job,
                idx as i64,
                Box::pin(futures::stream::once(async move { Ok(bytes) })),
            )
            .await
            .expect("chunk");
    }

    let committed = ctx
        .services
        .model_upload_service
        .commit(&job)
        .await
        .expect("commit");
    assert_eq!(committed.checksum, checksum);

    let record = ctx
        .services
        .model_service
        .get_record(&started.model_id)
        .await
        .expect("record");
    assert_eq!(record.train_status, JobStatus::Complete.as_str());

    let artifact = ctx
        .object_store
        .get_bytes(&format!("models/{}/model/model.bin", started.model_id))
        .await
        .expect("artifact");
    assert_eq!(artifact, payload);
}

#[test]
async fn out_of_order_chunks_are_rejected() {
    let ctx = make_context().await;
    let (_, alice) = signup(&ctx, "alice").await;

    let started = ctx
        .services
        .model_upload_service
        .start(
            &alice,
            &StartModelUploadRequest {
                model_name: "unordered".to_string(),
                model_type: bazaar_common::model::ModelType::Ndb,
                checksum: None,
            },
        )
        .await
        .expect("start upload");
    let job = JobAuthorisation {
        model_id: started.model_id,
        role: JobTokenRole::Upload,
    };

    let bytes = bytes::Bytes::from_static(b"chunk");
    let result = ctx
        .services
        .model_upload_service
        .put_chunk(
            &job,
            1,
            Box::pin(futures::stream::once(async move { Ok(bytes) })),
        )
        .await;
    assert!(matches!(
        result,
        Err(ModelUploadError::ChunkOutOfOrder { expected: 0, got: 1 })
    ));
}

#[test]
async fn checksum_mismatch_rejects_commit_and_keeps_model_not_started() {
    let ctx = make_context().await;
    let (_, alice) = signup(&ctx, "alice").await;

    let started = ctx
        .services
        .model_upload_service
        .start(
            &alice,
            &StartModelUploadRequest {
                model_name: "corrupted".to_string(),
                model_type: bazaar_common::model::ModelType::Ndb,
                checksum: Some(hex::encode(Sha256::digest(b"expected content"))),
            },
        )
        .await
        .expect("start upload");
    let job = JobAuthorisation {
        model_id: started.model_id,
        role: JobTokenRole::Upload,
    };

    let bytes = bytes::Bytes::from_static(b"corrupted content");
    ctx.services
        .model_upload_service
        .put_chunk(
            &job,
            0,
            Box::pin(futures::stream::once(async move { Ok(bytes) })),
        )
        .await
        .expect("chunk");

    let result = ctx.services.model_upload_service.commit(&job).await;
    assert!(matches!(
        result,
        Err(ModelUploadError::ChecksumMismatch { .. })
    ));

    let record = ctx
        .services
        .model_service
        .get_record(&started.model_id)
        .await
        .expect("record");
    assert_eq!(record.train_status, JobStatus::NotStarted.as_str());
}

// --- S7: stop/delete blocked by dependents ----------------------------------

#[test]
async fn delete_and_undeploy_blocked_by_dependents() {
    let ctx = make_context().await;
    let (_, alice) = signup(&ctx, "alice").await;

    let ndb = train_ndb(&ctx, &alice, "base").await;
    worker_completes_training(&ctx, ndb).await;

    let composite = ctx
        .services
        .train_service
        .create_composite(
            &alice,
            bazaar_common::model::ModelType::EnterpriseSearch,
            &CreateCompositeRequest {
                model_name: "es".to_string(),
                dependency_ids: vec![ndb],
            },
        )
        .await
        .expect("composite")
        .model_id;

    let delete = ctx.services.model_service.delete(&ndb).await;
    assert!(matches!(delete, Err(ModelError::DependencyInUse(_, _))));
    assert!(ctx.services.model_service.get_record(&ndb).await.is_ok());

    let undeploy = ctx.services.deploy_service.undeploy(&ndb).await;
    assert!(matches!(undeploy, Err(DeployError::DependencyInUse(_, _))));

    // once the dependent is stopped, both operations go through
    ctx.model_repo
        .update_deploy_status(
            &composite.0,
            &[JobStatus::NotStarted],
            JobStatus::Stopped,
        )
        .await
        .expect("stop composite");

    ctx.services
        .deploy_service
        .undeploy(&ndb)
        .await
        .expect("undeploy");
    ctx.services.model_service.delete(&ndb).await.expect("delete");
    assert!(matches!(
        ctx.services.model_service.get_record(&ndb).await,
        Err(ModelError::NotFound(_))
    ));
}

// --- deploy lifecycle -------------------------------------------------------

#[test]
async fn deploy_lifecycle_and_worker_callbacks() {
    let ctx = make_context().await;
    let (_, alice) = signup(&ctx, "alice").await;

    let model_id = train_ndb(&ctx, &alice, "servable").await;

    // deploying before training completes is an invalid state
    let premature = ctx
        .services
        .deploy_service
        .deploy(
            &alice,
            &model_id,
            &DeployRequest {
                deployment_name: None,
                autoscaling: false,
                min_instances: 1,
                max_instances: 1,
                memory_mb: None,
            },
        )
        .await;
    assert!(matches!(premature, Err(DeployError::InvalidState(_))));

    worker_completes_training(&ctx, model_id).await;

    let deployed = ctx
        .services
        .deploy_service
        .deploy(
            &alice,
            &model_id,
            &DeployRequest {
                deployment_name: Some("prod".to_string()),
                autoscaling: false,
                min_instances: 1,
                max_instances: 2,
                memory_mb: Some(900),
            },
        )
        .await
        .expect("deploy");
    assert_eq!(deployed.status, JobStatus::Starting);

    let info = ctx
        .orchestrator
        .job_info(&deploy_job_name(&model_id))
        .await
        .expect("job info");
    assert_eq!(info.status, JobState::Running);

    ctx.services
        .deploy_service
        .update_status(&deploy_job_auth(model_id), WorkerStatus::InProgress)
        .await
        .expect("in progress");
    ctx.services
        .deploy_service
        .update_status(&deploy_job_auth(model_id), WorkerStatus::Complete)
        .await
        .expect("complete");

    // terminal resends are idempotent
    ctx.services
        .deploy_service
        .update_status(&deploy_job_auth(model_id), WorkerStatus::Complete)
        .await
        .expect("idempotent resend");

    let status = ctx
        .services
        .deploy_service
        .status(&model_id)
        .await
        .expect("status");
    assert_eq!(status.status, JobStatus::Complete);

    ctx.services
        .deploy_service
        .undeploy(&model_id)
        .await
        .expect("undeploy");
    let status = ctx
        .services
        .deploy_service
        .status(&model_id)
        .await
        .expect("status");
    assert_eq!(status.status, JobStatus::Stopped);

    let info = ctx
        .orchestrator
        .job_info(&deploy_job_name(&model_id))
        .await
        .expect("job info");
    assert_eq!(info.status, JobState::NotFound);
}

// --- license gate -----------------------------------------------------------

#[test]
async fn license_cpu_cap_blocks_training() {
    let ctx = make_context_with_cpu_limit(1000).await;
    let (_, alice) = signup(&ctx, "alice").await;

    let result = ctx
        .services
        .train_service
        .train_ndb(
            &alice,
            &TrainNdbRequest {
                model_name: "too-big".to_string(),
                data: local_data(),
                model_options: HashMap::new(),
                job_options: JobOptions {
                    allocation_cores: 1,
                    allocation_memory_mb: None,
                },
            },
        )
        .await;
    assert!(matches!(
        result,
        Err(TrainError::License(LicenseError::CpuExceeded { .. }))
    ));
}

// --- user deletion transfers models ------------------------------------------

#[test]
async fn deleting_a_user_transfers_models_to_the_admin() {
    let ctx = make_context().await;
    let admin = signup_admin(&ctx, "root").await;
    let (bob_user, bob) = signup(&ctx, "bob").await;

    let model_id = train_ndb(&ctx, &bob, "bobs-model").await;

    ctx.services
        .user_service
        .delete(&bob_user.id, &admin)
        .await
        .expect("delete user");

    let record = ctx
        .services
        .model_service
        .get_record(&model_id)
        .await
        .expect("record");
    assert_eq!(record.owner_id, admin.user.id.0);

    assert!(matches!(
        ctx.services.user_service.get(&bob_user.id).await,
        Err(UserError::NotFound(_))
    ));
}

// --- train submission details ------------------------------------------------

#[test]
async fn train_writes_config_and_starts_job() {
    let ctx = make_context().await;
    let (_, alice) = signup(&ctx, "alice").await;

    let model_id = train_ndb(&ctx, &alice, "configured").await;

    let config_bytes = ctx
        .object_store
        .get_bytes(&format!("models/{model_id}/train_config.json"))
        .await
        .expect("train config");
    let config: serde_json::Value = serde_json::from_slice(&config_bytes).expect("json");
    assert_eq!(config["modelId"], serde_json::json!(model_id.to_string()));
    assert_eq!(config["licensePayload"], serde_json::json!("license-payload"));
    assert!(!config["jobToken"].as_str().unwrap_or_default().is_empty());

    let spec = ctx
        .orchestrator
        .job_spec(&train_job_name(&model_id))
        .await
        .expect("job spec");
    assert_eq!(spec.cpu_mhz, 2400);
    assert!(spec.env.contains_key("JOB_TOKEN"));
}

#[test]
async fn upload_references_must_be_owned() {
    let ctx = make_context().await;
    let (_, alice) = signup(&ctx, "alice").await;
    let (_, eve) = signup(&ctx, "eve").await;

    let upload = ctx
        .services
        .upload_service
        .create(&alice)
        .await
        .expect("upload");

    let request = TrainNdbRequest {
        model_name: "upload-train".to_string(),
        data: vec![FileDescriptor {
            path: upload.id.to_string(),
            location: FileLocation::Upload,
            source_id: None,
            options: HashMap::new(),
            metadata: HashMap::new(),
        }],
        model_options: HashMap::new(),
        job_options: JobOptions::default(),
    };

    // the wrong user is denied
    let stolen = ctx.services.train_service.train_ndb(&eve, &request).await;
    assert!(matches!(
        stolen,
        Err(TrainError::Upload(
            bazaar_service::service::upload::UploadError::NotOwned(_)
        ))
    ));

    // the owner goes through
    ctx.services
        .train_service
        .train_ndb(&alice, &request)
        .await
        .expect("train from upload");
}

// --- backups -----------------------------------------------------------------

#[test]
async fn backups_dump_tables_with_manifest() {
    let ctx = make_context().await;
    let admin = signup_admin(&ctx, "root").await;
    let (_, alice) = signup(&ctx, "alice").await;
    train_ndb(&ctx, &alice, "model-in-backup").await;

    let backup = ctx
        .services
        .backup_service
        .create(&admin)
        .await
        .expect("backup");
    assert_eq!(backup.status, "complete");

    let manifest_bytes = ctx
        .object_store
        .get_bytes(&format!("{}/manifest.json", backup.path))
        .await
        .expect("manifest");
    let manifest: serde_json::Value = serde_json::from_slice(&manifest_bytes).expect("json");
    assert_eq!(manifest["tables"]["users"], serde_json::json!(2));
    assert_eq!(manifest["tables"]["models"], serde_json::json!(1));

    let listed = ctx.services.backup_service.list().await.expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].path, backup.path);
}
