mod test_support;

use serde_json::json;
use test_support::{error_code, seed_catalog, str_field, temp_dir, Session};

#[test]
fn renewal_links_successor_and_status_operations_apply() {
    let workspace = temp_dir("academy-renewal");
    let mut s = Session::start_at("2026-01-25");
    s.select(&workspace);
    let cat = seed_catalog(&mut s, 4, 25_000, &["martes"]);
    let created = s.ok(
        "enrollments.create",
        json!({
            "studentId": cat.student_id,
            "modalityId": cat.modality_id,
            "slotIds": cat.slot_ids,
            "startDate": "2026-01-01",
            "endDate": "2026-01-31",
            "initialStatus": "activo",
        }),
    );
    let old_id = str_field(&created["enrollment"], "id");

    let suspended = s.ok("enrollments.suspend", json!({ "enrollmentId": old_id }));
    assert_eq!(suspended["status"], "suspendida");
    let blocked = s.fail("enrollments.renew", json!({ "enrollmentId": old_id }));
    assert_eq!(error_code(&blocked), "invalid_state_transition");
    assert_eq!(blocked["error"]["details"]["currentState"], "suspendida");
    // Fee still unpaid, so reactivation lands in arrears.
    let reactivated = s.ok("enrollments.reactivate", json!({ "enrollmentId": old_id }));
    assert_eq!(reactivated["status"], "en_mora");
    let _ = s.ok(
        "payments.register",
        json!({ "enrollmentId": old_id, "amountCents": 25_000, "method": "efectivo" }),
    );

    let renewed = s.call(
        "enrollments.renew",
        json!({
            "enrollmentId": old_id,
            "payment": { "amountCents": 25_000, "method": "efectivo" },
        }),
    );
    assert_eq!(renewed["status"], 201, "{}", renewed);
    let data = &renewed["data"];
    assert_eq!(data["previous"]["status"], "renovado");
    assert_eq!(data["previous"]["slots"][0]["status"], "liberado");
    assert_eq!(data["canceledClasses"], 1);
    assert_eq!(data["enrollment"]["status"], "activo");
    assert_eq!(data["enrollment"]["startDate"], "2026-02-01");
    assert_eq!(data["enrollment"]["renewedFromId"], old_id.as_str());
    assert_eq!(data["schedule"]["slots"][0]["created"], 4);

    let slots = s.ok("slots.list", json!({}));
    assert_eq!(slots[0]["currentOccupancy"], 1);

    let again = s.fail("enrollments.renew", json!({ "enrollmentId": old_id }));
    assert_eq!(error_code(&again), "invalid_state_transition");

    let reconciled = s.ok(
        "enrollments.reconcile",
        json!({ "enrollmentId": str_field(&data["enrollment"], "id") }),
    );
    assert_eq!(reconciled["drift"].as_array().expect("drift").len(), 0);

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn expire_due_closes_ended_periods() {
    let workspace = temp_dir("academy-expire");
    let enrollment_id = {
        let mut s = Session::start_at("2026-01-05");
        s.select(&workspace);
        let cat = seed_catalog(&mut s, 4, 25_000, &["martes"]);
        let created = s.ok(
            "enrollments.create",
            json!({
                "studentId": cat.student_id,
                "modalityId": cat.modality_id,
                "slotIds": cat.slot_ids,
                "startDate": "2026-01-01",
                "endDate": "2026-01-31",
            }),
        );
        str_field(&created["enrollment"], "id")
    };

    let mut s = Session::start_at("2026-02-02");
    s.select(&workspace);
    let expired = s.ok("enrollments.expireDue", json!({}));
    assert_eq!(expired["expired"][0], enrollment_id.as_str());
    let view = s.ok("enrollments.get", json!({ "enrollmentId": enrollment_id }));
    assert_eq!(view["status"], "vencida");
    assert_eq!(view["slots"][0]["status"], "liberado");
    let listed = s.ok("enrollments.list", json!({ "status": "vencida" }));
    assert_eq!(listed.as_array().expect("list").len(), 1);

    let _ = std::fs::remove_dir_all(workspace);
}
