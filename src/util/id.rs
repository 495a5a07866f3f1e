use uuid::Uuid;

pub fn request_id() -> String {
    format!("req-{}", Uuid::new_v4())
}
