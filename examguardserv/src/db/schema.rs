// Diesel schema for the examguard database
use diesel::table;
use diesel::allow_tables_to_appear_in_same_query;

table! {
    students (id) {
        id -> Text,
        batch_id -> Nullable<Text>,
        created_at -> BigInt,
    }
}

table! {
    batches (id) {
        id -> Text,
        name -> Text,
        max_attempts -> Nullable<Integer>,
        max_security_incidents -> Nullable<Integer>,
        enable_auto_suspend -> Nullable<Bool>,
        additional_security_incidents_after_removal -> Nullable<Integer>,
        additional_attempts_after_payment -> Nullable<Integer>,
        created_at -> BigInt,
    }
}

table! {
    settings (key) {
        key -> Text,
        value -> Text,
        updated_at -> BigInt,
    }
}

table! {
    security_incidents (id) {
        id -> Text,
        student_id -> Text,
        exam_id -> Text,
        incident_type -> Text,
        details -> Text,
        reported_at -> BigInt,
        user_agent -> Nullable<Text>,
        ip_address -> Nullable<Text>,
        caused_suspension -> Bool,
        handled_by_payment -> Bool,
        handled_at -> Nullable<BigInt>,
        suspension_removal_payment_ref -> Nullable<Text>,
    }
}

table! {
    exam_suspensions (id) {
        id -> Text,
        student_id -> Text,
        exam_id -> Text,
        incidents -> Text,
        reason -> Text,
        suspension_time -> BigInt,
        reviewed_by_admin -> Bool,
        admin_notes -> Nullable<Text>,
        reviewed_at -> Nullable<BigInt>,
        reviewed_by -> Nullable<Text>,
        removed -> Bool,
        removed_at -> Nullable<BigInt>,
    }
}

table! {
    payments (id) {
        id -> Text,
        student_id -> Text,
        exam_id -> Text,
        amount -> BigInt,
        status -> Text,
        payment_type -> Text,
        gateway_order_id -> Text,
        gateway_payment_id -> Nullable<Text>,
        additional_attempts -> Nullable<Integer>,
        additional_attempts_granted -> Bool,
        additional_attempts_granted_at -> Nullable<BigInt>,
        reinstated_at -> Nullable<BigInt>,
        created_at -> BigInt,
    }
}

table! {
    exam_results (id) {
        id -> Text,
        student_id -> Text,
        exam_id -> Text,
        score -> Double,
        passed -> Bool,
        from_previous_payment_cycle -> Bool,
        submitted_at -> BigInt,
    }
}

allow_tables_to_appear_in_same_query!(
    students,
    batches,
    settings,
    security_incidents,
    exam_suspensions,
    payments,
    exam_results,
);
