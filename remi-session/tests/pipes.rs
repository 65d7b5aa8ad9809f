mod common;

use std::sync::Arc;

use pretty_assertions::assert_eq;
use remi_session::{
    ParamKind, RemoteInfo, RemoteMethod, RemoteParameter, RemoteThrowable, Skeleton, Value,
};

use common::{init_logger, pair};

fn stream_info() -> RemoteInfo {
    RemoteInfo::new("LineStream").method(
        RemoteMethod::new("transform")
            .param(RemoteParameter::of(ParamKind::Str))
            .pipe(),
    )
}

fn stream_skeleton() -> Skeleton {
    let mut skeleton = Skeleton::new(stream_info());
    skeleton
        .handle_pipe("transform", |args, pipe| {
            let fail = |e: remi_session::WireError| RemoteThrowable::new("PipeFailure", e.to_string());
            let prefix = match args.first() {
                Some(Value::Str(s)) => s.clone(),
                _ => String::new(),
            };
            let mut lines = Vec::new();
            let mut input = pipe.input();
            while let Some(line) = input.read_string().map_err(fail)? {
                lines.push(format!("{}{}", prefix, line.to_uppercase()));
            }
            drop(input);
            let mut output = pipe.output();
            for line in &lines {
                output.write_string(Some(line.as_str())).map_err(fail)?;
            }
            output.write_string(None).map_err(fail)?;
            output.flush().map_err(fail)?;
            Ok(())
        })
        .unwrap();
    skeleton
}

#[test]
fn test_pipe_streams_both_ways() {
    init_logger();
    let (client, server) = pair();
    let export = server.export(stream_skeleton()).unwrap();
    server.set_root(&export);
    let stub = client.remote_root().unwrap().unwrap();

    let pipe = stub
        .open_pipe("transform", vec![Value::Str("> ".to_string())])
        .unwrap();
    {
        let mut out = pipe.output();
        for line in ["one", "two", "three"] {
            out.write_string(Some(line)).unwrap();
        }
        out.write_string(None).unwrap();
        out.flush().unwrap();
    }
    let mut received = Vec::new();
    {
        let mut input = pipe.input();
        while let Some(line) = input.read_string().unwrap() {
            received.push(line);
        }
    }
    assert_eq!(received, vec!["> ONE", "> TWO", "> THREE"]);
    pipe.close();

    // the pipe channel never returns to the pool
    assert_eq!(client.status().pooled_channels, 0);

    // and the session happily serves the next invocation
    let again = stub
        .open_pipe("transform", vec![Value::Str("".to_string())])
        .unwrap();
    {
        let mut out = again.output();
        out.write_string(Some("more")).unwrap();
        out.write_string(None).unwrap();
        out.flush().unwrap();
    }
    let mut input = again.input();
    assert_eq!(input.read_string().unwrap(), Some("MORE".to_string()));

    client.close();
    server.close();
}
