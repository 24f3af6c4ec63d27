//! Upload subsystem: multipart form uploads and raw PUT/DELETE (C10).

use crate::host::{multipart, path};
use crate::{Handled, Method, Request, Response, StatusCode};
use std::path::Path;
use tokio::fs;

/// Handles a request matched to an `Upload` route.
///
/// `POST` with a `multipart/form-data` body writes each file part under
/// `dir` with a sanitized filename. `PUT` writes the raw body to the
/// file named by the last URL segment. `DELETE` removes it.
pub(crate) async fn handle(request: &Request, response: &mut Response, dir: &Path, max_upload_size: usize) -> Handled {
    if let Some(len) = request.content_length() {
        if len > max_upload_size {
            return response.status(StatusCode::PayloadTooLarge).body("Payload Too Large");
        }
    }

    match request.method() {
        Method::Post => handle_multipart(request, response, dir).await,
        Method::Put => handle_put(request, response, dir).await,
        Method::Delete => handle_delete(request, response, dir).await,
        _ => response.status(StatusCode::MethodNotAllowed).body("Method Not Allowed"),
    }
}

async fn handle_multipart(request: &Request, response: &mut Response, dir: &Path) -> Handled {
    let Some(content_type) = request.header(b"content-type") else {
        return response.status(StatusCode::BadRequest).body("Missing Content-Type");
    };
    let Ok(boundary) = multipart::boundary(content_type) else {
        return response.status(StatusCode::BadRequest).body("Missing multipart boundary");
    };
    let body = request.body().unwrap_or(&[]);
    let Ok(parts) = multipart::parse(body, boundary) else {
        return response.status(StatusCode::BadRequest).body("Malformed multipart body");
    };

    let mut saved = Vec::new();
    let mut fields = Vec::new();
    for part in parts {
        match part.filename.as_deref() {
            Some(filename) => {
                let Some(safe_name) = path::sanitize_filename(filename.as_bytes()) else { continue };

                let dest = dir.join(&safe_name);
                if fs::write(&dest, part.data).await.is_err() {
                    return response.status(StatusCode::InternalServerError).body("Internal Server Error");
                }
                saved.push(safe_name);
            }
            // Plain form fields have no `filename=`; surface them back to the
            // caller alongside the saved file names rather than discarding them.
            None => fields.push((part.name, String::from_utf8_lossy(part.data).into_owned())),
        }
    }

    if saved.is_empty() {
        return response.status(StatusCode::BadRequest).body("No file parts in upload");
    }

    response
        .status(StatusCode::Ok)
        .header("content-type", "application/json")
        .body_with(|writer| {
            writer.write("{\"saved\":[");
            for (i, name) in saved.iter().enumerate() {
                if i > 0 {
                    writer.write(",");
                }
                writer.write("\"");
                writer.write(name.replace('"', "\\\""));
                writer.write("\"");
            }
            writer.write("],\"fields\":{");
            for (i, (key, value)) in fields.iter().enumerate() {
                if i > 0 {
                    writer.write(",");
                }
                writer.write("\"");
                writer.write(key.replace('"', "\\\""));
                writer.write("\":\"");
                writer.write(value.replace('"', "\\\""));
                writer.write("\"");
            }
            writer.write("}}");
        })
}

async fn handle_put(request: &Request, response: &mut Response, dir: &Path) -> Handled {
    let Some(filename) = path::sanitize_filename(request.url().path()) else {
        return response.status(StatusCode::BadRequest).body("Invalid upload filename");
    };
    let dest = dir.join(&filename);
    let existed = fs::metadata(&dest).await.is_ok();
    let body = request.body().unwrap_or(&[]);

    if fs::write(&dest, body).await.is_err() {
        return response.status(StatusCode::InternalServerError).body("Internal Server Error");
    }

    if existed {
        response.status(StatusCode::NoContent).body("")
    } else {
        response.status(StatusCode::Created).body("")
    }
}

async fn handle_delete(request: &Request, response: &mut Response, dir: &Path) -> Handled {
    let Some(filename) = path::sanitize_filename(request.url().path()) else {
        return response.status(StatusCode::BadRequest).body("Invalid upload filename");
    };
    let dest = dir.join(&filename);

    match fs::remove_file(&dest).await {
        Ok(()) => response.status(StatusCode::NoContent).body(""),
        Err(_) => response.status(StatusCode::NotFound).body("Not Found"),
    }
}
