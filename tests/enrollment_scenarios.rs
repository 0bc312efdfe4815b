mod test_support;

use serde_json::{json, Value};
use test_support::{add_student, error_code, seed_catalog, str_field, temp_dir, Session};

fn class_dates(classes: &Value) -> Vec<String> {
    classes["classes"]
        .as_array()
        .expect("classes array")
        .iter()
        .map(|c| c["date"].as_str().unwrap_or_default().to_string())
        .collect()
}

#[test]
fn single_tuesday_slot_clamps_to_matching_dates() {
    let workspace = temp_dir("academy-scenario-a");
    let mut s = Session::start_at("2026-01-01");
    s.select(&workspace);
    let cat = seed_catalog(&mut s, 12, 25_000, &["martes"]);

    let resp = s.call(
        "enrollments.create",
        json!({
            "studentId": cat.student_id,
            "modalityId": cat.modality_id,
            "slotIds": cat.slot_ids,
            "startDate": "2026-01-01",
            "endDate": "2026-01-31",
        }),
    );
    assert_eq!(resp["success"], true, "{}", resp);
    assert_eq!(resp["status"], 201);
    let data = &resp["data"];
    assert_eq!(data["enrollment"]["status"], "en_mora");
    assert_eq!(data["schedule"]["slots"][0]["created"], 4);
    assert_eq!(data["schedule"]["slots"][0]["shortfall"], 8);
    assert!(!data["schedule"]["warnings"].as_array().expect("warnings").is_empty());
    let enrollment_id = str_field(&data["enrollment"], "id");

    let classes = s.ok("classes.list", json!({ "enrollmentId": enrollment_id }));
    assert_eq!(
        class_dates(&classes),
        vec!["2026-01-06", "2026-01-13", "2026-01-20", "2026-01-27"]
    );
    assert!(classes["classes"]
        .as_array()
        .expect("classes")
        .iter()
        .all(|c| c["state"] == "programada"));

    // Re-running the generator adds nothing.
    let again = s.ok(
        "enrollments.generateSchedule",
        json!({ "enrollmentId": enrollment_id }),
    );
    assert_eq!(again["slots"][0]["created"], 0);
    assert_eq!(again["slots"][0]["existing"], 4);
    let classes = s.ok("classes.list", json!({ "enrollmentId": enrollment_id }));
    assert_eq!(class_dates(&classes).len(), 4);

    let slots = s.ok("slots.list", json!({ "modalityId": cat.modality_id }));
    assert_eq!(slots[0]["currentOccupancy"], 1);

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn two_slots_split_quota_and_fail_policy_rolls_back() {
    let workspace = temp_dir("academy-scenario-b");
    let mut s = Session::start_at("2026-01-01");
    s.select(&workspace);
    let cat = seed_catalog(&mut s, 12, 25_000, &["tuesday", "jueves"]);

    let rejected = s.fail(
        "enrollments.create",
        json!({
            "studentId": cat.student_id,
            "modalityId": cat.modality_id,
            "slotIds": cat.slot_ids,
            "startDate": "2026-01-01",
            "endDate": "2026-01-31",
            "onInsufficientDates": "fail",
        }),
    );
    assert_eq!(error_code(&rejected), "insufficient_data");
    assert_eq!(rejected["status"], 400);
    assert_eq!(rejected["error"]["details"]["required"], 6);

    let listed = s.ok("enrollments.list", json!({ "studentId": cat.student_id }));
    assert_eq!(listed.as_array().expect("list").len(), 0);
    let slots = s.ok("slots.list", json!({}));
    assert!(slots
        .as_array()
        .expect("slots")
        .iter()
        .all(|slot| slot["currentOccupancy"] == 0));

    let created = s.ok(
        "enrollments.create",
        json!({
            "studentId": cat.student_id,
            "modalityId": cat.modality_id,
            "slotIds": cat.slot_ids,
            "startDate": "2026-01-01",
            "endDate": "2026-02-28",
            "onInsufficientDates": "fail",
        }),
    );
    let slots = created["enrollment"]["slots"].as_array().expect("slots");
    assert_eq!(slots.len(), 2);
    assert!(slots.iter().all(|es| es["classesAllocated"] == 6));
    let enrollment_id = str_field(&created["enrollment"], "id");
    let classes = s.ok("classes.list", json!({ "enrollmentId": enrollment_id }));
    let dates = class_dates(&classes);
    assert_eq!(dates.len(), 12);
    assert_eq!(dates.first().map(String::as_str), Some("2026-01-01"));
    assert!(dates.contains(&"2026-02-10".to_string()));
    assert!(!dates.contains(&"2026-02-17".to_string()));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn attended_mark_moves_every_counter_layer() {
    let workspace = temp_dir("academy-scenario-c");
    let mut s = Session::start_at("2026-01-06");
    s.select(&workspace);
    let cat = seed_catalog(&mut s, 12, 25_000, &["martes"]);
    let created = s.ok(
        "enrollments.create",
        json!({
            "studentId": cat.student_id,
            "modalityId": cat.modality_id,
            "slotIds": cat.slot_ids,
            "startDate": "2026-01-01",
            "endDate": "2026-01-31",
            "actorId": "front-desk",
        }),
    );
    let enrollment_id = str_field(&created["enrollment"], "id");
    assert_eq!(created["enrollment"]["createdBy"], "front-desk");

    let marked = s.ok(
        "attendance.mark",
        json!({
            "enrollmentId": enrollment_id,
            "slotId": cat.slot_ids[0],
            "date": "2026-01-06",
            "state": "asistio",
        }),
    );
    assert_eq!(marked["clamped"], false);
    assert!(marked["previous"].is_null());

    let view = s.ok("enrollments.get", json!({ "enrollmentId": enrollment_id }));
    assert_eq!(view["classesAttended"], 1);
    assert_eq!(view["classesRemaining"], 11);
    assert_eq!(view["slots"][0]["classesAttended"], 1);
    assert_eq!(view["slots"][0]["classesRemaining"], 11);

    let classes = s.ok("classes.list", json!({ "enrollmentId": enrollment_id }));
    assert_eq!(classes["classes"][0]["date"], "2026-01-06");
    assert_eq!(classes["classes"][0]["state"], "realizada");

    let future = s.fail(
        "attendance.mark",
        json!({
            "enrollmentId": enrollment_id,
            "slotId": cat.slot_ids[0],
            "date": "2026-01-13",
            "state": "asistio",
        }),
    );
    assert_eq!(error_code(&future), "validation_error");
    assert_eq!(future["status"], 422);

    let records = s.ok("attendance.list", json!({ "enrollmentId": enrollment_id }));
    assert_eq!(records["records"].as_array().expect("records").len(), 1);

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn overlap_and_capacity_are_rejected() {
    let workspace = temp_dir("academy-overlap");
    let mut s = Session::start_at("2026-01-01");
    s.select(&workspace);
    let student = add_student(&mut s, "Luis Vega");
    let modality = s.ok(
        "modalities.create",
        json!({ "name": "Boxing", "classesTotal": 4, "monthlyFeeCents": 20_000 }),
    );
    let modality_id = str_field(&modality, "id");
    let slot = s.ok(
        "slots.create",
        json!({
            "modalityId": modality_id,
            "weekday": "miércoles",
            "startTime": "07:00",
            "endTime": "08:00",
            "maxOccupancy": 1,
        }),
    );
    assert_eq!(slot["weekday"], "wednesday");
    let slot_id = str_field(&slot, "id");
    let params = |student_id: &str| {
        json!({
            "studentId": student_id,
            "modalityId": modality_id,
            "slotIds": [slot_id],
            "startDate": "2026-01-01",
            "endDate": "2026-01-31",
        })
    };

    let first = s.ok("enrollments.create", params(&student));
    let first_id = str_field(&first["enrollment"], "id");

    let overlap = s.fail("enrollments.create", params(&student));
    assert_eq!(error_code(&overlap), "conflict");
    assert_eq!(overlap["status"], 409);
    assert_eq!(overlap["error"]["details"]["existingId"], first_id.as_str());

    let other = add_student(&mut s, "Marta Ríos");
    let full = s.fail("enrollments.create", params(&other));
    assert_eq!(error_code(&full), "capacity_exceeded");
    assert_eq!(full["error"]["details"]["maxOccupancy"], 1);

    let _ = std::fs::remove_dir_all(workspace);
}
