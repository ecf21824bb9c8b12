use crate::http::{RequestParts, ResponseParts};

pub fn request_parts(method: &str, uri: &str, headers: &[(&str, &str)]) -> RequestParts {
	let mut builder = ::http::Request::builder().method(method).uri(uri);
	for (name, value) in headers {
		builder = builder.header(*name, *value);
	}
	let (parts, _) = builder.body(()).unwrap().into_parts();
	parts
}

pub fn response_parts(status: u16, headers: &[(&str, &str)]) -> ResponseParts {
	let mut builder = ::http::Response::builder().status(status);
	for (name, value) in headers {
		builder = builder.header(*name, *value);
	}
	let (parts, _) = builder.body(()).unwrap().into_parts();
	parts
}
