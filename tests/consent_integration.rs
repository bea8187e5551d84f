//! Integration tests for the consent handshake and the audit trail

use std::sync::Arc;
use std::time::Duration;

use clinic_records::db::patients::{get_patient, NewPatient};
use clinic_records::db::users::NewStaffUser;
use clinic_records::services::{spawn_audit_listener, ConsentForm, RedemptionPolicy, ServiceOptions};
use clinic_records::{ActingUser, ClinicDb, ClinicError, Role, Services};
use tempfile::TempDir;

fn open(policy: RedemptionPolicy) -> (Services, Arc<ClinicDb>, ActingUser, TempDir) {
    let temp = TempDir::new().unwrap();
    let db = Arc::new(ClinicDb::open(temp.path()).unwrap());
    let services = Services::new(
        db.clone(),
        ServiceOptions {
            redemption_policy: policy,
            portal_base_url: "https://portal.clinic.test".into(),
            ..Default::default()
        },
    );
    let secretary = {
        let admin = services
            .staff
            .create_user(None, &NewStaffUser {
                name: "Root".into(),
                email: "root@clinic.test".into(),
                role: Role::Admin,
            })
            .unwrap()
            .as_acting_user();
        services
            .staff
            .create_user(Some(&admin), &NewStaffUser {
                name: "Marta".into(),
                email: "marta@clinic.test".into(),
                role: Role::Secretary,
            })
            .unwrap()
            .as_acting_user()
    };
    (services, db, secretary, temp)
}

fn form(name: &str, cpf: &str) -> ConsentForm {
    ConsentForm {
        full_name: name.into(),
        cpf: cpf.into(),
        how_found: Some("Google".into()),
        signature_location: Some("São Paulo".into()),
    }
}

#[test]
fn test_strict_handshake_reaches_terminal_state() {
    let (services, db, secretary, _temp) = open(RedemptionPolicy::Strict);
    let issued = services
        .patients
        .create_patient(&secretary, &NewPatient { name: "Natália Ávila".into(), ..Default::default() })
        .unwrap();
    assert_eq!(
        issued.portal_link,
        format!("https://portal.clinic.test/portal/login/{}", issued.token)
    );

    let session = services.consent.redeem_token(&issued.token).unwrap();
    assert_eq!(session.patient_name, "Natália Ávila");

    let receipt = services
        .consent
        .submit_consent(&session, &form("Natália D´Ávila", "111.444.777-35"))
        .unwrap();
    assert!(!receipt.already_consented);

    let row = db.with_conn(|conn| get_patient(conn, issued.patient.id)).unwrap().unwrap();
    assert!(row.has_consented());
    assert_eq!(row.consent_cpf.as_deref(), Some("11144477735"));
    assert_eq!(row.signature_location.as_deref(), Some("São Paulo"));

    assert!(matches!(
        services.consent.redeem_token(&issued.token),
        Err(ClinicError::InvalidToken)
    ));

    // a stale session cannot clear or overwrite consent
    let again = services
        .consent
        .submit_consent(&session, &form("Outra Pessoa", "529.982.247-25"))
        .unwrap();
    assert!(again.already_consented);
    assert_eq!(again.consent_given_at, receipt.consent_given_at);

    let row = db.with_conn(|conn| get_patient(conn, issued.patient.id)).unwrap().unwrap();
    assert_eq!(row.consent_name.as_deref(), Some("Natália D´Ávila"));
    assert_eq!(row.consent_given_at.as_deref(), Some(receipt.consent_given_at.as_str()));
}

#[test]
fn test_permissive_policy_keeps_token_usable() {
    let (services, _db, secretary, _temp) = open(RedemptionPolicy::Permissive);
    let issued = services
        .patients
        .create_patient(&secretary, &NewPatient { name: "Otávio Pinto".into(), ..Default::default() })
        .unwrap();

    let first = services
        .consent
        .redeem_and_submit(&issued.token, &form("Otávio Pinto", "52998224725"))
        .unwrap();
    let second = services
        .consent
        .redeem_and_submit(&issued.token, &form("Otávio Pinto", "52998224725"))
        .unwrap();

    assert!(!first.already_consented);
    assert!(second.already_consented);
    assert_eq!(first.consent_given_at, second.consent_given_at);
}

#[test]
fn test_rejected_form_does_not_advance() {
    let (services, db, secretary, _temp) = open(RedemptionPolicy::Strict);
    let issued = services
        .patients
        .create_patient(&secretary, &NewPatient { name: "Paula Quintana".into(), ..Default::default() })
        .unwrap();

    let err = services
        .consent
        .redeem_and_submit(&issued.token, &form("Paula Quintana", "123.456.789-00"))
        .unwrap_err();
    match err {
        ClinicError::Validation(errors) => {
            assert!(errors.has("cpf"));
            assert!(!errors.has("name"));
            assert_eq!(errors.submitted.get("name").map(String::as_str), Some("Paula Quintana"));
        }
        other => panic!("expected validation error, got {:?}", other),
    }

    let pending = services.patients.list_pending_consents(&secretary, 10).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].access_token.as_deref(), Some(issued.token.as_str()));

    let row = db.with_conn(|conn| get_patient(conn, issued.patient.id)).unwrap().unwrap();
    assert!(row.consent_given_at.is_none());
    assert!(row.consent_cpf.is_none());
}

#[tokio::test]
async fn test_audit_trail_records_consent_and_ledger_writes() {
    let (services, db, secretary, _temp) = open(RedemptionPolicy::Strict);
    let listener = spawn_audit_listener(services.events.clone(), db.clone());

    let issued = services
        .patients
        .create_patient(&secretary, &NewPatient { name: "Rui Santos".into(), ..Default::default() })
        .unwrap();
    let patient_id = issued.patient.id;
    services
        .consent
        .redeem_and_submit(&issued.token, &form("Rui Santos", "111.444.777-35"))
        .unwrap();

    let admin = services.staff.get_user(1).unwrap().as_acting_user();
    services
        .ledger
        .record_clinical_update(&admin, patient_id, &Default::default(), None)
        .unwrap();

    let entries = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let entries = services.audit.list_entries(&admin, "Patient", patient_id).unwrap();
            if entries.len() >= 3 {
                return entries;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("audit entries were not written");

    let actions: Vec<&str> = entries.iter().map(|e| e.action.as_str()).collect();
    assert_eq!(
        actions,
        vec![
            "Created patient",
            "Patient gave consent through the portal",
            "Added new clinical record entry",
        ]
    );
    assert_eq!(entries[1].user_id, 0);
    assert_eq!(entries[1].user_name, "Patient portal");
    assert_eq!(entries[2].user_id, admin.id);

    listener.abort();
}
